pub mod aggregator;
pub mod angle;
pub mod iq;
pub mod locators;
pub mod models;
pub mod settings;
