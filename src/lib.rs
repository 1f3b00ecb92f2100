pub mod climate;
pub mod commands;
pub mod connection;
pub mod mqtt;
pub mod output;
pub mod poller;
pub mod register_cache;
pub mod registers;

#[cfg(test)]
mod testing;
