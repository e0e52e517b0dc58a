//! Memcache text-protocol client for storage nodes.
//!
//! Only the subset the router needs: `get`, `set` and `delete`.

use super::client::{NodeClient, NodeConnector};
use super::pool::{NodePool, PoolConfig, PoolStats};
use crate::core::{ProxyError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// One TCP connection to a storage node.
pub struct MemcacheConnection {
    addr: String,
    stream: BufStream<TcpStream>,
    max_value_size: usize,
}

impl MemcacheConnection {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::NodeTimeout {
                addr: addr.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|err| ProxyError::NodeUnavailable {
                addr: addr.to_string(),
                reason: err.to_string(),
            })?;
        stream.set_nodelay(true).map_err(|err| ProxyError::NodeUnavailable {
            addr: addr.to_string(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            addr: addr.to_string(),
            stream: BufStream::new(stream),
            max_value_size: PoolConfig::default().max_value_size,
        })
    }

    /// Replies announcing a longer value are rejected as protocol errors.
    pub fn max_value_size(mut self, max: usize) -> Self {
        self.max_value_size = max;
        self
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.send(format!("get {}\r\n", key).as_bytes()).await?;

        let header = self.read_line().await?;
        if header == "END" {
            return Ok(None);
        }

        let mut parts = header.split_whitespace();
        let (Some("VALUE"), Some(_key), Some(_flags), Some(len)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(self.protocol(format!("unexpected get reply '{}'", header)));
        };
        let len: usize = len
            .parse()
            .map_err(|_| self.protocol(format!("invalid value length '{}'", len)))?;
        if len > self.max_value_size {
            return Err(self.protocol(format!(
                "value length {} exceeds limit {}",
                len, self.max_value_size
            )));
        }
        let block_len = len
            .checked_add(2)
            .ok_or_else(|| self.protocol(format!("invalid value length '{}'", len)))?;

        let mut data = vec![0u8; block_len];
        self.stream
            .read_exact(&mut data)
            .await
            .map_err(|err| self.io(err))?;
        if !data.ends_with(b"\r\n") {
            return Err(self.protocol("value block not terminated by CRLF".to_string()));
        }
        data.truncate(len);

        let trailer = self.read_line().await?;
        if trailer != "END" {
            return Err(self.protocol(format!("expected END, got '{}'", trailer)));
        }
        Ok(Some(data))
    }

    pub async fn set(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let mut request = format!("set {} 0 0 {}\r\n", key, value.len()).into_bytes();
        request.extend_from_slice(value);
        request.extend_from_slice(b"\r\n");
        self.send(&request).await?;

        match self.read_line().await?.as_str() {
            "STORED" => Ok(()),
            other => Err(self.protocol(format!("set rejected: '{}'", other))),
        }
    }

    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        self.send(format!("delete {}\r\n", key).as_bytes()).await?;

        match self.read_line().await?.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(self.protocol(format!("delete rejected: '{}'", other))),
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await.map_err(|err| self.io(err))?;
        self.stream.flush().await.map_err(|err| self.io(err))
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = self
            .stream
            .read_line(&mut line)
            .await
            .map_err(|err| self.io(err))?;
        if read == 0 {
            return Err(ProxyError::NodeUnavailable {
                addr: self.addr.clone(),
                reason: "connection closed by node".to_string(),
            });
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR") {
            return Err(self.protocol(line));
        }
        Ok(line)
    }

    fn io(&self, err: std::io::Error) -> ProxyError {
        ProxyError::NodeUnavailable {
            addr: self.addr.clone(),
            reason: err.to_string(),
        }
    }

    fn protocol(&self, reason: String) -> ProxyError {
        ProxyError::Protocol {
            addr: self.addr.clone(),
            reason,
        }
    }
}

/// [`NodeClient`] over a pool of memcache connections.
pub struct MemcacheNode {
    pool: NodePool,
}

impl MemcacheNode {
    pub fn new(addr: impl Into<String>, config: PoolConfig) -> Self {
        Self {
            pool: NodePool::new(addr, config),
        }
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }
}

// Every exchange releases its connection only after a full reply was read;
// on error the guard is dropped and the connection discarded.
#[async_trait]
impl NodeClient for MemcacheNode {
    fn addr(&self) -> &str {
        self.pool.addr()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut guard = self.pool.checkout().await?;
        let Some(connection) = guard.connection() else {
            return Err(ProxyError::NodeUnavailable {
                addr: self.addr().to_string(),
                reason: "connection already returned".to_string(),
            });
        };
        let value = connection.get(key).await?;
        guard.release().await;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut guard = self.pool.checkout().await?;
        let Some(connection) = guard.connection() else {
            return Err(ProxyError::NodeUnavailable {
                addr: self.addr().to_string(),
                reason: "connection already returned".to_string(),
            });
        };
        connection.set(key, value).await?;
        guard.release().await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut guard = self.pool.checkout().await?;
        let Some(connection) = guard.connection() else {
            return Err(ProxyError::NodeUnavailable {
                addr: self.addr().to_string(),
                reason: "connection already returned".to_string(),
            });
        };
        let existed = connection.delete(key).await?;
        guard.release().await;
        Ok(existed)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Opens pooled memcache clients; connections are established lazily on first use.
#[derive(Debug, Clone, Default)]
pub struct MemcacheConnector {
    config: PoolConfig,
}

impl MemcacheConnector {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NodeConnector for MemcacheConnector {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn NodeClient>> {
        Ok(Arc::new(MemcacheNode::new(addr, self.config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    /// Minimal memcache server holding values in memory.
    async fn spawn_fake_node() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store = Arc::new(tokio::sync::Mutex::new(HashMap::<String, Vec<u8>>::new()));

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let store = store.clone();
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut reader = BufReader::new(read);
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let parts: Vec<&str> = line.split_whitespace().collect();
                        let reply = match parts.as_slice() {
                            ["get", key] => match store.lock().await.get(*key) {
                                Some(value) => {
                                    let mut out =
                                        format!("VALUE {} 0 {}\r\n", key, value.len()).into_bytes();
                                    out.extend_from_slice(value);
                                    out.extend_from_slice(b"\r\nEND\r\n");
                                    out
                                }
                                None => b"END\r\n".to_vec(),
                            },
                            ["set", key, _, _, len] => {
                                let len: usize = len.parse().unwrap();
                                let mut data = vec![0u8; len + 2];
                                reader.read_exact(&mut data).await.unwrap();
                                data.truncate(len);
                                store.lock().await.insert(key.to_string(), data);
                                b"STORED\r\n".to_vec()
                            }
                            ["delete", key] => match store.lock().await.remove(*key) {
                                Some(_) => b"DELETED\r\n".to_vec(),
                                None => b"NOT_FOUND\r\n".to_vec(),
                            },
                            _ => b"ERROR\r\n".to_vec(),
                        };
                        if write.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_set_get_delete_round() {
        let addr = spawn_fake_node().await;
        let node = MemcacheNode::new(addr, PoolConfig::default());

        assert_eq!(node.get("missing").await.unwrap(), None);
        node.set("k1", b"hello\r\nworld").await.unwrap();
        assert_eq!(node.get("k1").await.unwrap(), Some(b"hello\r\nworld".to_vec()));
        assert!(node.delete("k1").await.unwrap());
        assert!(!node.delete("k1").await.unwrap());

        let stats = node.pool_stats().await;
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.available_connections, 1);
    }

    /// Node that answers every request line with `reply` verbatim.
    async fn spawn_scripted_node(reply: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut reader = BufReader::new(read);
                    let mut line = String::new();
                    while reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                        line.clear();
                        if write.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_oversized_value_header_is_protocol_error() {
        let addr = spawn_scripted_node(b"VALUE k 0 18446744073709551615\r\n").await;
        let node = MemcacheNode::new(addr, PoolConfig::default());
        let err = node.get("k").await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol { .. }), "unexpected error: {err:?}");
        assert!(err.is_node_level());
        // The connection sits mid-reply, so it is not pooled.
        assert_eq!(node.pool_stats().await.total_connections, 0);

        let addr = spawn_scripted_node(b"VALUE k 0 2048\r\n").await;
        let node = MemcacheNode::new(addr, PoolConfig::default().max_value_size(1024));
        assert!(matches!(
            node.get("k").await,
            Err(ProxyError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_node_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let node = MemcacheNode::new(addr, PoolConfig::default());
        let err = node.get("k").await.unwrap_err();
        assert!(err.is_node_level(), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn test_closed_node_rejects_calls() {
        let addr = spawn_fake_node().await;
        let node = MemcacheNode::new(addr, PoolConfig::default());
        node.set("k", b"v").await.unwrap();
        node.close().await;
        assert!(node.get("k").await.is_err());
        assert_eq!(node.pool_stats().await.total_connections, 0);
    }
}
