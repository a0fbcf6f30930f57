//! HTTP client for the partner service.
//!
//! Implements [`PartnerClient`] on top of `reqwest`:
//!
//! - `POST {base}{create_path}` with a JSON body creates a request
//! - `GET {base}{result_path}/{correlation_id}?Type=JSON` fetches its result
//! - `GET {base}{kinds_path}` lists the request kinds
//!
//! Every call carries the `api-key` query parameter. The client performs a
//! single HTTP exchange per call; retries and circuit breaking live in the
//! runtime's call guard.
//!
//! # Example
//!
//! ```no_run
//! use order_gateway_core::config::PartnerConfig;
//! use order_gateway_core::partner::PartnerClient;
//! use order_gateway_partner::PartnerHttpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PartnerHttpClient::new(&PartnerConfig::default())?;
//! let kinds = client.request_kinds().await?;
//! println!("{kinds}");
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::{PartnerHttpClient, MAX_ERROR_BODY};
