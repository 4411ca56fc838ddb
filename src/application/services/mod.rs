pub mod health_checker;
pub mod maintenance;
pub mod order_dispatcher;
pub mod webhook_pipeline;
