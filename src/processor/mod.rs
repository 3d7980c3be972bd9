pub mod alert_processor;
