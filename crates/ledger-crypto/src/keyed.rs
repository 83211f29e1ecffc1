use async_trait::async_trait;
use ledger_types::{CommitId, ObjectDigest, ObjectIdentifier, ObjectIdentifierFactory};
use rand::RngCore;

use crate::encryption::{ChunkingPermutation, EncryptionError, EncryptionResult, EncryptionService};

const NONCE_SIZE: usize = 16;
const TAG_SIZE: usize = 32;
const KEY_CONTEXT: &str = "ledger keyed encryption v1";

/// Key index handed to every identifier minted locally.
pub const DEFAULT_KEY_INDEX: u32 = 0;
/// Deletion scope handed to every identifier minted locally.
pub const DEFAULT_DELETION_SCOPE_ID: u32 = 0;

/// Symmetric [`EncryptionService`] built on keyed BLAKE3.
///
/// Sealed payloads are `nonce || ciphertext || tag`, where the ciphertext is
/// the payload XORed with the keyed BLAKE3 output stream of the nonce, and the
/// tag authenticates nonce and ciphertext. Object payloads are additionally
/// bound to their identifier.
pub struct KeyedEncryptionService {
    key: [u8; 32],
}

impl KeyedEncryptionService {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive the key from a passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(blake3::derive_key(KEY_CONTEXT, passphrase.as_bytes()))
    }

    fn keyed(&self, domain: &str) -> blake3::Hasher {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(domain.as_bytes());
        hasher.update(b":");
        hasher
    }

    fn tag(&self, domain: &str, context: &[u8], nonce: &[u8], ciphertext: &[u8]) -> [u8; 32] {
        let mut hasher = self.keyed(domain);
        hasher.update(b"tag:");
        hasher.update(&(context.len() as u64).to_le_bytes());
        hasher.update(context);
        hasher.update(nonce);
        hasher.update(ciphertext);
        *hasher.finalize().as_bytes()
    }

    fn apply_keystream(&self, domain: &str, nonce: &[u8], data: &mut [u8]) {
        let mut hasher = self.keyed(domain);
        hasher.update(b"stream:");
        hasher.update(nonce);
        let mut stream = vec![0u8; data.len()];
        hasher.finalize_xof().fill(&mut stream);
        for (byte, key) in data.iter_mut().zip(stream) {
            *byte ^= key;
        }
    }

    fn seal(&self, domain: &str, context: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut body = plaintext.to_vec();
        self.apply_keystream(domain, &nonce, &mut body);
        let tag = self.tag(domain, context, &nonce, &body);

        let mut sealed = Vec::with_capacity(NONCE_SIZE + body.len() + TAG_SIZE);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&body);
        sealed.extend_from_slice(&tag);
        sealed
    }

    fn open(&self, domain: &str, context: &[u8], sealed: &[u8]) -> EncryptionResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(EncryptionError::InvalidArgument(format!(
                "sealed payload of {} bytes is too short",
                sealed.len()
            )));
        }
        let (nonce, rest) = sealed.split_at(NONCE_SIZE);
        let (body, tag) = rest.split_at(rest.len() - TAG_SIZE);
        if self.tag(domain, context, nonce, body)[..] != tag[..] {
            return Err(EncryptionError::InvalidArgument(
                "authentication tag mismatch".to_string(),
            ));
        }
        let mut plaintext = body.to_vec();
        self.apply_keystream(domain, nonce, &mut plaintext);
        Ok(plaintext)
    }
}

impl Default for KeyedEncryptionService {
    fn default() -> Self {
        Self::from_passphrase("ledger")
    }
}

impl std::fmt::Debug for KeyedEncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedEncryptionService")
            .field("key", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl EncryptionService for KeyedEncryptionService {
    fn make_object_identifier(
        &self,
        factory: &ObjectIdentifierFactory,
        digest: ObjectDigest,
    ) -> ObjectIdentifier {
        factory.make_object_identifier(DEFAULT_KEY_INDEX, DEFAULT_DELETION_SCOPE_ID, digest)
    }

    async fn encrypt_commit(&self, commit_storage: &[u8]) -> EncryptionResult<Vec<u8>> {
        Ok(self.seal("commit", &[], commit_storage))
    }

    async fn decrypt_commit(&self, encrypted: &[u8]) -> EncryptionResult<Vec<u8>> {
        self.open("commit", &[], encrypted)
    }

    async fn get_object_name(&self, identifier: &ObjectIdentifier) -> EncryptionResult<String> {
        let mut hasher = self.keyed("object-name");
        hasher.update(&identifier.key_index().to_le_bytes());
        hasher.update(&identifier.deletion_scope_id().to_le_bytes());
        hasher.update(identifier.digest().as_bytes());
        Ok(hasher.finalize().to_hex().to_string())
    }

    async fn encrypt_object(
        &self,
        identifier: &ObjectIdentifier,
        content: &[u8],
    ) -> EncryptionResult<Vec<u8>> {
        Ok(self.seal("object", &identifier.encode(), content))
    }

    async fn decrypt_object(
        &self,
        identifier: &ObjectIdentifier,
        encrypted: &[u8],
    ) -> EncryptionResult<Vec<u8>> {
        self.open("object", &identifier.encode(), encrypted)
    }

    async fn get_chunking_permutation(&self) -> EncryptionResult<ChunkingPermutation> {
        let mut mask = [0u8; 8];
        self.keyed("chunking-permutation")
            .finalize_xof()
            .fill(&mut mask);
        let mask = u64::from_le_bytes(mask);
        Ok(ChunkingPermutation::new(move |chunk_window_hash| {
            chunk_window_hash ^ mask
        }))
    }

    fn get_entry_id(&self) -> Vec<u8> {
        let mut id = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut id);
        id
    }

    fn get_entry_id_for_merge(
        &self,
        entry_name: &str,
        left_parent_id: &CommitId,
        right_parent_id: &CommitId,
        operation_list: &str,
    ) -> Vec<u8> {
        let mut hasher = self.keyed("merge-entry-id");
        hasher.update(&(entry_name.len() as u64).to_le_bytes());
        hasher.update(entry_name.as_bytes());
        hasher.update(left_parent_id.as_bytes());
        hasher.update(right_parent_id.as_bytes());
        hasher.update(operation_list.as_bytes());
        hasher.finalize().as_bytes().to_vec()
    }
}
