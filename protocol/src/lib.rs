pub mod backplate;
pub mod bus;
pub mod crc16;
pub mod fabdcfg;
pub mod hvac;
pub mod protos;
pub mod security;
pub mod timespec;
