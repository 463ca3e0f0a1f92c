// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::output::AssetId;
use chain_canonical_serialization::{CanonicalDeserialize, CanonicalSerialize, Reader, Writer};
use chain_crypto::HashValue;
use chain_failure_ext::Result;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// `(asset_id, definition_hash)`; the latest ADP per asset ID records the
/// hash of its current declared definition blob (§3 "Asset Definition
/// Pointer (ADP)").
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct AssetDefinitionPointer {
    pub asset_id: AssetId,
    pub definition_hash: HashValue,
}

impl AssetDefinitionPointer {
    pub fn new(asset_id: AssetId, definition_hash: HashValue) -> Self {
        AssetDefinitionPointer {
            asset_id,
            definition_hash,
        }
    }
}

impl CanonicalSerialize for AssetDefinitionPointer {
    fn write_canonical(&self, w: &mut Writer) {
        w.write_fixed(self.asset_id.as_bytes());
        w.write_fixed(self.definition_hash.as_bytes());
    }
}

impl CanonicalDeserialize for AssetDefinitionPointer {
    fn read_canonical(r: &mut Reader<'_>) -> Result<Self> {
        let asset_id = HashValue::try_from(r.read_fixed(32)?.as_slice())?;
        let definition_hash = HashValue::try_from(r.read_fixed(32)?.as_slice())?;
        Ok(AssetDefinitionPointer {
            asset_id,
            definition_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_round_trips() {
        let adp = AssetDefinitionPointer::new(
            HashValue::sha3_256_of(b"asset"),
            HashValue::sha3_256_of(b"definition"),
        );
        let bytes = adp.to_canonical_bytes();
        assert_eq!(AssetDefinitionPointer::from_canonical_bytes(&bytes).unwrap(), adp);
    }
}
