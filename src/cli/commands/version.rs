//! `ruleguard version`

use crate::cli::Output;
use anyhow::Result;

pub async fn execute(output: &Output) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");

    output.header(&format!("{name} v{version}"));
    output.key_value("Description:", env!("CARGO_PKG_DESCRIPTION"), false);
    output.key_value("Repository:", env!("CARGO_PKG_REPOSITORY"), false);
    output.key_value("Target:", std::env::consts::ARCH, false);
    output.key_value(
        "Profile:",
        if cfg!(debug_assertions) { "debug" } else { "release" },
        false,
    );
    output.key_value("Result schema:", crate::engine::transport::SCHEMA, true);

    if output.is_quiet() {
        println!("{name} {version}");
    }
    Ok(())
}
