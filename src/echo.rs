//! Demo handlers used by the `poolserver serve` command.

use crate::connection::Connection;
use crate::server::ServerContext;
use anyhow::Context;
use std::io;

/// Copy everything the peer sends back to it until the peer half-closes.
pub fn echo_handler(conn: &mut Connection, _ctx: &ServerContext) -> anyhow::Result<()> {
    let mut reader = conn.stream().try_clone().context("failed to clone stream")?;
    let copied = io::copy(&mut reader, conn).context("echo failed")?;
    tracing::debug!(bytes = copied, "echoed");
    Ok(())
}

/// Read and throw away everything the peer sends.
pub fn discard_handler(conn: &mut Connection, _ctx: &ServerContext) -> anyhow::Result<()> {
    let discarded = io::copy(conn, &mut io::sink()).context("discard failed")?;
    tracing::debug!(bytes = discarded, "discarded");
    Ok(())
}
