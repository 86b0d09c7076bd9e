pub mod assets;
pub mod capture;
pub mod config;
pub mod detection;
pub mod display;
pub mod filter;
pub mod markers;
pub mod pipeline;
