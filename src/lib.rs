#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod data_channel;
pub mod demux;
pub mod error;
pub mod message;
