//! HTTP façade over one WhatsApp Web session.
//!
//! Routes live under `/api/whatsapp`; see [`http::build_router`].
pub mod config;
pub mod cors;
pub mod error;
pub mod http;
mod main_logic;
mod reqid;
pub mod uploads;

pub use main_logic::run;
