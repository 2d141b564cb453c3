pub mod broker;
pub mod http;
pub mod imap;
pub mod sqlite;
