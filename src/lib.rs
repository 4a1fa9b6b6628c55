pub mod arg_parser;
pub mod auto_controller;
pub mod config_manager;
pub mod dbus_service;
pub mod devices_manager;
pub mod errors;
pub mod fan_curve;
pub mod logger;
pub mod notifier;
pub mod sensor;

#[cfg(test)]
pub mod test_utils;
