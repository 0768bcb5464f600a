use data_encoding::HEXLOWER;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::DefinitionError;

/// Length of the hash, short enough to be used as a label value.
pub const DEFINITION_HASH_LENGTH: usize = 40;

/// Content hash of a definition, computed over its JSON form. Maps in the
/// definition model are ordered, so equal definitions always hash equally.
pub fn definition_hash<T: Serialize>(definition: &T) -> Result<String, DefinitionError> {
    let serialized = serde_json::to_vec(definition).map_err(DefinitionError::Serialization)?;
    let digest = Sha256::digest(&serialized);
    let mut encoded = HEXLOWER.encode(&digest);

    encoded.truncate(DEFINITION_HASH_LENGTH);

    Ok(encoded)
}
