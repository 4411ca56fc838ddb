pub mod binance_client;
pub mod bybit_client;
pub mod exchange_client_factory;
pub mod http;
