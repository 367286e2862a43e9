//! Bluetooth LE angle-of-arrival gateway
//!
//! Connects to CTE-transmitting tags, turns their IQ reports into angle
//! observations per locator and combines the observations of all configured
//! locators into position fixes.

pub mod domain;
pub mod estimation;
pub mod infrastructure;
