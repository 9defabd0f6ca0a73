//! Sign command implementation.

use colored::Colorize;
use teak_core::SdkConfig;
use teak_core::request::signing;

/// What to sign.
#[derive(Debug)]
pub struct SignRequest {
    pub secret: String,
    pub endpoint: String,
    pub host: String,
    pub method: String,
    pub body: String,
}

/// Print the signature header for `request`.
pub fn execute(config: &SdkConfig, request: &SignRequest, canonical: bool) -> anyhow::Result<()> {
    let method = request.method.to_uppercase();
    if canonical {
        let text = signing::canonical_string(&method, &request.host, &request.endpoint, &request.body, &request.secret)?;
        println!("{}", "Canonical string:".bold());
        print!("{text}");
        println!();
    }

    let signature = signing::sign(&method, &request.host, &request.endpoint, &request.body, &request.secret)?;
    println!("{}: {}", config.transport.signature_header, signing::authorization_value(&signature));
    Ok(())
}
