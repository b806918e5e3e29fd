pub mod media_fetcher;
pub mod proxy_supervisor;
