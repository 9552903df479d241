use std::sync::Arc;

use async_trait::async_trait;
use tether_core::protocol::PluginCall;
use tether_core::{
    BlobData, ErrorKind, HostError, HostResult, RowsFormatter, RowsIterator, RowsOutput,
};

use super::{Disposal, RemoteLink};

/// Formatter living in a plugin. Only blobs that live in the same plugin can
/// be handed to it.
pub struct RemoteRowsFormatter {
    link: RemoteLink,
    handle: i32,
    disposal: Disposal,
}

impl RemoteRowsFormatter {
    pub fn new(link: RemoteLink, handle: i32) -> Self {
        Self {
            link,
            handle,
            disposal: Disposal::default(),
        }
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    pub fn dispose(&self) {
        self.disposal.mark();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposal.is_disposed()
    }

    fn blob_handle(blob: &dyn BlobData) -> HostResult<i32> {
        blob.remote_handle().ok_or_else(|| {
            HostError::data(
                ErrorKind::CannotCast,
                "formatter input must be a blob owned by the plugin",
            )
        })
    }
}

#[async_trait]
impl RowsFormatter for RemoteRowsFormatter {
    async fn open_input(
        &self,
        blob: Arc<dyn BlobData>,
        key: Option<&str>,
    ) -> HostResult<Arc<dyn RowsIterator>> {
        let blob_handle = Self::blob_handle(blob.as_ref())?;
        let handle: i32 = self
            .link
            .call_object(
                &self.disposal,
                "rows formatter",
                PluginCall::RowsFormatterOpenInput {
                    handle: self.handle,
                    blob_handle,
                    key: key.map(str::to_string),
                },
            )
            .await?;
        let iterator: Arc<dyn RowsIterator> = self.link.rows_iterator(handle).await?;
        Ok(iterator)
    }

    async fn open_output(&self, blob: Arc<dyn BlobData>) -> HostResult<Arc<dyn RowsOutput>> {
        let blob_handle = Self::blob_handle(blob.as_ref())?;
        let handle: i32 = self
            .link
            .call_object(
                &self.disposal,
                "rows formatter",
                PluginCall::RowsFormatterOpenOutput {
                    handle: self.handle,
                    blob_handle,
                },
            )
            .await?;
        let output: Arc<dyn RowsOutput> = self.link.rows_output(handle)?;
        Ok(output)
    }

    fn remote_handle(&self) -> Option<i32> {
        Some(self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteBlob;
    use crate::testing::{FakePlugin, FakeRows, LocalBlob};
    use tether_core::protocol::VariantValue;

    #[tokio::test]
    async fn open_input_returns_tracked_iterator() {
        let plugin = FakePlugin::start().await;
        plugin.add_rows(
            77,
            FakeRows::new(vec![("line", "string")], vec![vec![VariantValue::String("a".into())]]),
        );
        plugin.set_formatter_result(77);

        let formatter = RemoteRowsFormatter::new(plugin.link(), 20);
        let blob: Arc<dyn BlobData> = Arc::new(RemoteBlob::new(plugin.link(), 21));
        let rows = formatter.open_input(blob, Some("csv")).await.unwrap();
        assert_eq!(rows.remote_handle(), Some(77));
        assert!(plugin.storage().get(77).is_some());
        assert!(plugin.calls_for(20).contains(&PluginCall::RowsFormatterOpenInput {
            handle: 20,
            blob_handle: 21,
            key: Some("csv".into()),
        }));

        assert!(rows.read_next().await.unwrap());
    }

    #[tokio::test]
    async fn local_blob_is_rejected() {
        let plugin = FakePlugin::start().await;
        let formatter = RemoteRowsFormatter::new(plugin.link(), 20);
        let err = formatter.open_output(Arc::new(LocalBlob)).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::CannotCast);
        assert!(plugin.calls_for(20).is_empty());
    }
}
