//! On-disk container for a reference index.
//!
//! The flat arrays are serialized with rkyv. Loading deserializes into owned
//! vectors, validates them and rebuilds both k-d trees; the trees themselves
//! are never stored.

use std::path::Path;

use anyhow::Context;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

use super::{IndexProperties, ReferenceIndex};
use crate::error::IndexError;
use crate::solver::code::{Code, DIMQUADS};

/// Serializable flat arrays of a [`ReferenceIndex`].
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct IndexData {
    pub properties: IndexProperties,
    /// Unit vectors, one per star.
    pub stars: Vec<[f64; 3]>,
    /// External catalog ids, one per star.
    pub star_ids: Vec<u64>,
    /// Star ids of each quad in code order.
    pub quads: Vec<[u32; DIMQUADS]>,
    /// Code of each quad.
    pub codes: Vec<Code>,
}

impl TryFrom<IndexData> for ReferenceIndex {
    type Error = IndexError;

    fn try_from(data: IndexData) -> Result<Self, IndexError> {
        ReferenceIndex::new(
            data.properties,
            data.stars,
            data.star_ids,
            data.quads,
            data.codes,
        )
    }
}

impl ReferenceIndex {
    /// Copy of the flat arrays, ready to serialize.
    pub fn to_data(&self) -> IndexData {
        IndexData {
            properties: self.props.clone(),
            stars: self.stars.clone(),
            star_ids: self.star_ids.clone(),
            quads: self.quads.clone(),
            codes: self.codes.clone(),
        }
    }

    /// Serialize the index to bytes using rkyv.
    pub fn to_rkyv_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&self.to_data())
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {}", e))?;
        Ok(bytes.to_vec())
    }

    /// Deserialize and validate an index from rkyv bytes.
    pub fn from_rkyv_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let data = rkyv::from_bytes::<IndexData, rkyv::rancor::Error>(&aligned)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))?;
        Ok(ReferenceIndex::try_from(data)?)
    }

    /// Save the index to a file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = self.to_rkyv_bytes()?;
        std::fs::write(path, &bytes)
            .with_context(|| format!("writing index to {}", path.display()))?;
        info!("Saved index {} to {} ({} bytes)", self.props.index_id, path.display(), bytes.len());
        Ok(())
    }

    /// Load and validate an index from a file.
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading index from {}", path.display()))?;
        let index = Self::from_rkyv_bytes(&bytes)
            .with_context(|| format!("loading index from {}", path.display()))?;
        info!(
            "Loaded index {} from {}: {} stars, {} quads, scale {:.1}-{:.1} arcsec",
            index.props.index_id,
            path.display(),
            index.stars.len(),
            index.quads.len(),
            index.props.scale_lower_arcsec,
            index.props.scale_upper_arcsec,
        );
        Ok(index)
    }
}
