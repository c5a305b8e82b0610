use async_trait::async_trait;
use etcd_client::{Client, Event, EventType, GetOptions, WatchOptions};
use tracing::{debug, instrument};
use zonefile_sync_core::{
    KeyValue, KvEvent, KvTransport, RangeResult, Revision, TransportError, WatchStream,
};

/// `KvTransport` over the etcd v3 gRPC API.
#[derive(Clone)]
pub struct EtcdTransport {
    client: Client,
}

impl EtcdTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Only gRPC `UNAVAILABLE` is worth retrying.
fn classify(err: etcd_client::Error) -> TransportError {
    match &err {
        etcd_client::Error::GRpcStatus(status) if status.code() == tonic::Code::Unavailable => {
            TransportError::unavailable(err.to_string())
        }
        _ => TransportError::other(err.to_string()),
    }
}

fn utf8(bytes: Result<&str, etcd_client::Error>, what: &str) -> Result<String, TransportError> {
    bytes
        .map(str::to_string)
        .map_err(|e| TransportError::other(format!("{} is not valid UTF-8: {}", what, e)))
}

fn to_kv_event(event: &Event) -> Result<Option<KvEvent>, TransportError> {
    let Some(kv) = event.kv() else {
        return Ok(None);
    };
    let key = utf8(kv.key_str(), "key")?;
    let converted = match event.event_type() {
        EventType::Put => KvEvent::Put(KeyValue {
            value: utf8(kv.value_str(), "value")?,
            key,
        }),
        EventType::Delete => KvEvent::Delete { key },
    };
    Ok(Some(converted))
}

#[async_trait]
impl KvTransport for EtcdTransport {
    #[instrument(skip(self), level = "debug")]
    async fn range_prefix(&self, prefix: &str) -> Result<RangeResult, TransportError> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(classify)?;

        let revision = response
            .header()
            .map(|h| h.revision())
            .ok_or_else(|| TransportError::other("range response carries no header"))?;

        let kvs = response
            .kvs()
            .iter()
            .map(|kv| {
                Ok(KeyValue {
                    key: utf8(kv.key_str(), "key")?,
                    value: utf8(kv.value_str(), "value")?,
                })
            })
            .collect::<Result<Vec<_>, TransportError>>()?;

        debug!("Range {} returned {} key(s) at revision {}", prefix, kvs.len(), revision);
        Ok(RangeResult { kvs, revision })
    }

    #[instrument(skip(self), level = "debug")]
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> Result<WatchStream, TransportError> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (watcher, mut responses) = client
            .watch(prefix, Some(options))
            .await
            .map_err(classify)?;

        let batches = async_stream::stream! {
            // Dropping the watcher cancels the watch on the server.
            let _watcher = watcher;
            loop {
                let response = match responses.message().await {
                    Ok(Some(response)) => response,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(classify(e));
                        break;
                    }
                };

                if response.canceled() {
                    let reason = if response.compact_revision() > 0 {
                        format!(
                            "watch cancelled, revision {} has been compacted",
                            response.compact_revision()
                        )
                    } else {
                        format!("watch cancelled by server: {}", response.cancel_reason())
                    };
                    yield Err(TransportError::other(reason));
                    break;
                }

                let mut batch = Vec::with_capacity(response.events().len());
                let mut failed = None;
                for event in response.events() {
                    match to_kv_event(event) {
                        Ok(Some(converted)) => batch.push(converted),
                        Ok(None) => {}
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
                if !batch.is_empty() {
                    yield Ok(batch);
                }
                if let Some(e) = failed {
                    yield Err(e);
                    break;
                }
            }
        };

        Ok(Box::pin(batches))
    }
}
