//! MQTT to SQL bridge
//!
//! - `domain` - merged routing model and timestamp formats
//! - `infra` - configuration loading and merging, logging, cancellation, backoff
//! - `io` - MQTT connections and database managers
//! - `services` - message handler and the service generation loop

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
