//! Negative electricity price plans for GoodWe inverters.
//!
//! A plan is four banks of 96 quarter-hour slots (sell and buy, today and tomorrow) plus two
//! device flags, kept in the inverter's holding registers 47785 to 47812.

pub mod commands;
pub mod connection;
pub mod device;
pub mod dispatcher;
pub mod mask;
pub mod modbus;
pub mod output;
pub mod plan;
pub mod registers;
pub mod rollover;
pub mod writer;
