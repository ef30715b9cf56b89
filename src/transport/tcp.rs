//! Length-prefixed TCP exchange
//!
//! The fallback path for TC=1 replies: connect, write the two-byte length
//! prefix and the query, read the prefixed reply. The whole exchange,
//! connect included, shares one wall-clock budget.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ResolverError, Result};

/// Maximum reply size the two-byte prefix can describe
const MAX_TCP_MESSAGE_SIZE: usize = 65_535;

/// Perform one length-prefixed exchange within `budget`
///
/// # Errors
///
/// Timeouts anywhere inside the budget surface as `Timeout`; connection
/// and framing problems as `Network`/`Parse`.
pub async fn exchange(server: SocketAddr, query: &[u8], budget: Duration) -> Result<Vec<u8>> {
    timeout(budget, exchange_inner(server, query))
        .await
        .map_err(|_| ResolverError::timeout(format!("TCP exchange with {server}"), budget))?
}

async fn exchange_inner(server: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    if query.len() > MAX_TCP_MESSAGE_SIZE {
        return Err(ResolverError::serialize(format!(
            "query of {} bytes does not fit a TCP length prefix",
            query.len()
        )));
    }

    let mut stream = TcpStream::connect(server)
        .await
        .map_err(|e| ResolverError::network_io(format!("connect to {server}"), e))?;

    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    stream
        .write_all(&framed)
        .await
        .map_err(|e| ResolverError::network_io(format!("send to {server}"), e))?;

    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| ResolverError::network_io(format!("read length from {server}"), e))?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    if len == 0 {
        return Err(ResolverError::parse(format!(
            "zero-length TCP reply from {server}"
        )));
    }

    let mut reply = vec![0u8; len];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| ResolverError::network_io(format!("read reply from {server}"), e))?;
    Ok(reply)
}
