//! Configuration file templates
//!
//! Templates are compiled into the binary and rendered with minijinja.
//! Block tags swallow their own line so the rendered files carry no blank
//! lines where a conditional section was skipped.

use ferry_common::{Error, Result};
use minijinja::Environment;
use serde::Serialize;

/// stunnel configuration for the server side of a tunnel
pub const STUNNEL_SERVER: &str = "stunnel-server.conf";
/// stunnel configuration for the client side of a tunnel
pub const STUNNEL_CLIENT: &str = "stunnel-client.conf";
/// rsync daemon configuration
pub const RSYNCD: &str = "rsyncd.conf";
/// rclone remote configuration
pub const RCLONE: &str = "rclone.conf";

const TEMPLATES: &[(&str, &str)] = &[
    (
        STUNNEL_SERVER,
        include_str!("../templates/stunnel-server.conf"),
    ),
    (
        STUNNEL_CLIENT,
        include_str!("../templates/stunnel-client.conf"),
    ),
    (RSYNCD, include_str!("../templates/rsyncd.conf")),
    (RCLONE, include_str!("../templates/rclone.conf")),
];

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_keep_trailing_newline(true);
    for &(name, source) in TEMPLATES {
        env.add_template(name, source)
            .map_err(|e| Error::template(format!("invalid template {}: {}", name, e)))?;
    }
    Ok(env)
}

/// Render the named template with `ctx`
pub fn render<C: Serialize>(name: &str, ctx: C) -> Result<String> {
    let env = environment()?;
    let template = env
        .get_template(name)
        .map_err(|e| Error::template(format!("unknown template {}: {}", name, e)))?;
    template
        .render(ctx)
        .map_err(|e| Error::template(format!("failed to render {}: {}", name, e)))
}
