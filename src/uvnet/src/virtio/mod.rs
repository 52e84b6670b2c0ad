pub mod bindings;
pub mod net;
pub mod ring;
