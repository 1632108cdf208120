//! SQL-browser instance port lookup.
//!
//! Named instances listen on dynamic ports. The SQL browser service answers
//! CLNT_UCAST_INST datagrams on UDP 1434 with a `key;value;...` record for
//! the requested instance, from which the TCP port is extracted.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{ConnectionError, ErrorCode};

const SQL_BROWSER_PORT: u16 = 1434;
const CLNT_UCAST_INST: u8 = 0x04;

/// Resolve the TCP port of a named instance.
pub async fn lookup_instance_port(
    server: &str,
    instance_name: &str,
    wait: Duration,
) -> Result<u16, ConnectionError> {
    timeout(wait, query_browser(server, instance_name))
        .await
        .map_err(|_| {
            ConnectionError::new(
                ErrorCode::EInstLookup,
                format!("instance lookup for {server}\\{instance_name} timed out"),
            )
        })?
}

async fn query_browser(server: &str, instance_name: &str) -> Result<u16, ConnectionError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(|e| {
        ConnectionError::new(ErrorCode::EInstLookup, format!("UDP bind failed: {e}"))
    })?;

    let mut request = Vec::with_capacity(1 + instance_name.len());
    request.push(CLNT_UCAST_INST);
    request.extend_from_slice(instance_name.as_bytes());

    socket
        .send_to(&request, (server, SQL_BROWSER_PORT))
        .await
        .map_err(|e| {
            ConnectionError::new(ErrorCode::EInstLookup, format!("browser query failed: {e}"))
        })?;

    let mut response = vec![0u8; 1024];
    let (n, _peer) = socket.recv_from(&mut response).await.map_err(|e| {
        ConnectionError::new(ErrorCode::EInstLookup, format!("browser response failed: {e}"))
    })?;

    // Response: 0x05, u16 length, then an ASCII key;value record.
    if n < 3 || response[0] != 0x05 {
        return Err(ConnectionError::new(
            ErrorCode::EInstLookup,
            "malformed browser response",
        ));
    }

    let record = String::from_utf8_lossy(&response[3..n]);
    parse_port(&record, instance_name).ok_or_else(|| {
        ConnectionError::new(
            ErrorCode::EInstLookup,
            format!("instance {instance_name} not found in browser response"),
        )
    })
}

/// Find `tcp;<port>` within the record matching the requested instance.
fn parse_port(record: &str, instance_name: &str) -> Option<u16> {
    for entry in record.split(";;") {
        let fields: Vec<&str> = entry.split(';').collect();
        let mut matches_instance = false;
        let mut i = 0;
        while i + 1 < fields.len() {
            match fields[i] {
                "InstanceName" => {
                    matches_instance = fields[i + 1].eq_ignore_ascii_case(instance_name);
                }
                "tcp" if matches_instance => {
                    return fields[i + 1].parse().ok();
                }
                _ => {}
            }
            i += 2;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_matching_instance() {
        let record =
            "ServerName;HOST;InstanceName;SQLEXPRESS;IsClustered;No;Version;15.0.2000.5;tcp;50123;;";
        assert_eq!(parse_port(record, "SQLEXPRESS"), Some(50123));
        assert_eq!(parse_port(record, "sqlexpress"), Some(50123));
    }

    #[test]
    fn rejects_other_instances() {
        let record =
            "ServerName;HOST;InstanceName;OTHER;IsClustered;No;Version;15.0.2000.5;tcp;50123;;";
        assert_eq!(parse_port(record, "SQLEXPRESS"), None);
    }

    #[test]
    fn picks_the_right_record_among_many() {
        let record = "ServerName;HOST;InstanceName;A;IsClustered;No;Version;15.0;tcp;111;;\
                      ServerName;HOST;InstanceName;B;IsClustered;No;Version;15.0;tcp;222;;";
        assert_eq!(parse_port(record, "B"), Some(222));
    }
}
