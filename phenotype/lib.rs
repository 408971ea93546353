#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod cache;
pub mod channels;
pub mod config;
pub mod encode;
pub mod intensity;
pub mod io;
pub mod matcher;
pub mod optimize;
pub mod pipeline;
pub mod threshold;
pub mod types;
