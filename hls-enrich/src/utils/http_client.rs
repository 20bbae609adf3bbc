use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::Result;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build a `reqwest::Client` for outbound calls (AI providers, callbacks).
///
/// A zero `request_timeout` leaves the client without a total timeout.
pub fn build_client(request_timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("hls-enrich/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10));

    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }

    Ok(builder.build()?)
}
