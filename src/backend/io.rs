//! Block persistence over an `ObjectStore`.
//!
//! Layout: one block is one logical directory,
//! `<tenant>/<block_id>/{data.bin,index.bin,bloom-N.bin,meta.json}`.
//! `meta.json` is written last and deleted first: its presence is the commit
//! point that makes a block visible to discovery.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::ObjectStore;
use crate::block::{BlockId, BlockIndex, BlockMeta, BlockReader, BloomFilter, EncodedBlock};
use crate::error::{Result, TraceError};
use crate::model::TenantId;

const META_OBJECT: &str = "meta.json";
const DATA_OBJECT: &str = "data.bin";
const INDEX_OBJECT: &str = "index.bin";

#[derive(Clone)]
pub struct BlockStore {
    store: Arc<dyn ObjectStore>,
}

impl BlockStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn block_prefix(tenant: &TenantId, block_id: &BlockId) -> String {
        format!("{}/{}", tenant, block_id)
    }

    fn bloom_object(i: usize) -> String {
        format!("bloom-{}.bin", i)
    }

    /// Persist a block. Segments first, meta last.
    pub async fn write_block(&self, block: &EncodedBlock) -> Result<()> {
        let prefix = Self::block_prefix(&block.meta.tenant_id, &block.meta.block_id);

        self.store
            .put(&format!("{}/{}", prefix, DATA_OBJECT), Bytes::from(block.data.clone()))
            .await?;
        self.store
            .put(&format!("{}/{}", prefix, INDEX_OBJECT), Bytes::from(block.index.encode()))
            .await?;
        for (i, bloom) in block.blooms.iter().enumerate() {
            self.store
                .put(
                    &format!("{}/{}", prefix, Self::bloom_object(i)),
                    Bytes::from(bloom.encode()?),
                )
                .await?;
        }
        // Commit point.
        self.store
            .put(&format!("{}/{}", prefix, META_OBJECT), Bytes::from(block.meta.encode()?))
            .await?;

        debug!(
            tenant = %block.meta.tenant_id,
            block = %block.meta.block_id,
            traces = block.meta.trace_count,
            spans = block.meta.span_count,
            "block committed"
        );
        Ok(())
    }

    /// Discover all committed blocks for a tenant. Orphan segments without a
    /// meta object are invisible here.
    pub async fn list_blocks(&self, tenant: &TenantId) -> Result<Vec<BlockMeta>> {
        let keys = self.store.list(&format!("{}/", tenant)).await?;
        let mut metas = Vec::new();
        for key in keys {
            if !key.ends_with(META_OBJECT) {
                continue;
            }
            if let Some(bytes) = self.store.get(&key).await? {
                metas.push(BlockMeta::decode(&bytes)?);
            }
        }
        metas.sort_by_key(|m| (m.min_time_unix_nanos, m.block_id));
        Ok(metas)
    }

    /// All tenants that have at least one object.
    pub async fn tenants(&self) -> Result<Vec<TenantId>> {
        let keys = self.store.list("").await?;
        let mut tenants: Vec<TenantId> = keys
            .iter()
            .filter_map(|k| k.split('/').next())
            .map(str::to_string)
            .collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }

    /// Fetch every segment of a committed block into a seekable reader.
    pub async fn read_block(&self, meta: &BlockMeta) -> Result<BlockReader> {
        let prefix = Self::block_prefix(&meta.tenant_id, &meta.block_id);

        let data = self
            .store
            .get(&format!("{}/{}", prefix, DATA_OBJECT))
            .await?
            .ok_or_else(|| TraceError::Corrupt(format!("block {} missing data segment", meta.block_id)))?;
        let index_bytes = self
            .store
            .get(&format!("{}/{}", prefix, INDEX_OBJECT))
            .await?
            .ok_or_else(|| TraceError::Corrupt(format!("block {} missing index segment", meta.block_id)))?;
        let index = BlockIndex::decode(&index_bytes)?;

        let mut blooms = Vec::with_capacity(meta.bloom_shard_count);
        for i in 0..meta.bloom_shard_count {
            let bytes = self
                .store
                .get(&format!("{}/{}", prefix, Self::bloom_object(i)))
                .await?
                .ok_or_else(|| {
                    TraceError::Corrupt(format!("block {} missing bloom shard {}", meta.block_id, i))
                })?;
            blooms.push(BloomFilter::decode(&bytes)?);
        }

        Ok(BlockReader::new(meta.clone(), data.to_vec(), index, blooms))
    }

    /// Point lookup that fetches as little as possible: the relevant bloom
    /// shard first (negative short-circuits with no index or data access),
    /// then the index, then the data segment for the region decode.
    pub async fn find_trace_in_block(
        &self,
        meta: &BlockMeta,
        trace_id: &crate::model::TraceId,
    ) -> Result<Option<Vec<crate::model::Span>>> {
        let prefix = Self::block_prefix(&meta.tenant_id, &meta.block_id);

        let shard = crate::block::bloom::shard_for(trace_id, meta.bloom_shard_count);
        let bloom_bytes = self
            .store
            .get(&format!("{}/{}", prefix, Self::bloom_object(shard)))
            .await?
            .ok_or_else(|| {
                TraceError::Corrupt(format!("block {} missing bloom shard {}", meta.block_id, shard))
            })?;
        if !BloomFilter::decode(&bloom_bytes)?.maybe_contains(trace_id) {
            return Ok(None);
        }

        let index_bytes = self
            .store
            .get(&format!("{}/{}", prefix, INDEX_OBJECT))
            .await?
            .ok_or_else(|| TraceError::Corrupt(format!("block {} missing index segment", meta.block_id)))?;
        let entry = match BlockIndex::decode(&index_bytes)?.find(trace_id) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let data = self
            .store
            .get(&format!("{}/{}", prefix, DATA_OBJECT))
            .await?
            .ok_or_else(|| TraceError::Corrupt(format!("block {} missing data segment", meta.block_id)))?;
        let start = entry.offset as usize;
        let end = start + entry.len as usize;
        if end > data.len() {
            return Err(TraceError::Corrupt(format!(
                "block {} index entry past end of data",
                meta.block_id
            )));
        }
        crate::block::data::decode_record(&data[start..end]).map(Some)
    }

    /// Remove a block. Meta goes first so a crash mid-delete leaves only an
    /// invisible orphan, never a visible block with missing segments.
    pub async fn delete_block(&self, meta: &BlockMeta) -> Result<()> {
        let prefix = Self::block_prefix(&meta.tenant_id, &meta.block_id);
        self.store.delete(&format!("{}/{}", prefix, META_OBJECT)).await?;
        self.store.delete(&format!("{}/{}", prefix, DATA_OBJECT)).await?;
        self.store.delete(&format!("{}/{}", prefix, INDEX_OBJECT)).await?;
        for i in 0..meta.bloom_shard_count {
            self.store
                .delete(&format!("{}/{}", prefix, Self::bloom_object(i)))
                .await?;
        }
        debug!(tenant = %meta.tenant_id, block = %meta.block_id, "block deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::*;
    use crate::backend::MemoryStore;
    use crate::block;
    use crate::config::BlockConfig;
    use crate::model::{Span, SpanId, SpanStatus, TraceId};

    fn sample_block(tenant: &str, first_trace: u64, count: u64) -> EncodedBlock {
        let traces: BTreeMap<TraceId, Vec<Span>> = (first_trace..first_trace + count)
            .map(|t| {
                let id = TraceId::from_u64(t);
                let span = Span {
                    trace_id: id,
                    span_id: SpanId::from_u64(t),
                    parent_span_id: None,
                    service: "svc".into(),
                    operation: "op".into(),
                    start_unix_nanos: t as i64 * 1_000,
                    duration_nanos: 10,
                    attributes: HashMap::new(),
                    status: SpanStatus::Ok,
                };
                (id, vec![span])
            })
            .collect();
        block::encode(&tenant.to_string(), &traces, &BlockConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn write_list_read_delete() {
        let store = BlockStore::new(Arc::new(MemoryStore::new()));
        let block = sample_block("acme", 1, 10);
        store.write_block(&block).await.unwrap();

        let metas = store.list_blocks(&"acme".to_string()).await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].trace_count, 10);

        let reader = store.read_block(&metas[0]).await.unwrap();
        assert!(reader.find_trace(&TraceId::from_u64(5)).unwrap().is_some());

        store.delete_block(&metas[0]).await.unwrap();
        assert!(store.list_blocks(&"acme".to_string()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uncommitted_block_is_invisible() {
        let object_store = Arc::new(MemoryStore::new());
        let store = BlockStore::new(object_store.clone());
        let block = sample_block("acme", 1, 3);

        // Simulate a crash before the meta write: segments only.
        let prefix = format!("acme/{}", block.meta.block_id);
        object_store
            .put(&format!("{}/data.bin", prefix), Bytes::from(block.data.clone()))
            .await
            .unwrap();
        object_store
            .put(&format!("{}/index.bin", prefix), Bytes::from(block.index.encode()))
            .await
            .unwrap();

        assert!(store.list_blocks(&"acme".to_string()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenants_are_discovered() {
        let store = BlockStore::new(Arc::new(MemoryStore::new()));
        store.write_block(&sample_block("acme", 1, 2)).await.unwrap();
        store.write_block(&sample_block("umbrella", 1, 2)).await.unwrap();
        assert_eq!(store.tenants().await.unwrap(), vec!["acme", "umbrella"]);
    }
}
