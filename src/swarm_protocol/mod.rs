pub mod tcp_wire_protocol;
pub mod wire_protocol;
