//! 보안 모듈 - 서명, 암호화, MIC 다이제스트
//!
//! 흐름 (송신측):
//! 1. 암호화 전 원본 내용으로 MIC 계산
//! 2. Ed25519로 서명 (다이제스트 알고리즘 선택 가능)
//! 3. 임시 X25519 키쌍 + 파트너 공개키로 공유 비밀 계산
//! 4. ChaCha20-Poly1305로 세그먼트 암호화
//!
//! 순서는 항상 서명 후 암호화.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::config::IdentityConfig;
use crate::partnership::Partnership;

/// X25519 공개키 (32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce 크기 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 태그 크기 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 암호화 오류
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("암호화 실패: {0}")]
    EncryptionFailed(String),
    #[error("복호화 실패: {0}")]
    DecryptionFailed(String),
    #[error("잘못된 키: {0}")]
    InvalidKey(String),
    #[error("서명 검증 실패")]
    SignatureMismatch,
    #[error("인증서 지문 불일치: expected {expected}, actual {actual}")]
    FingerprintMismatch { expected: String, actual: String },
    #[error("보안 정책 불일치: {0}")]
    PolicyViolation(String),
    #[error("지원하지 않는 알고리즘: {0}")]
    Unsupported(&'static str),
}

/// MIC 다이제스트 알고리즘
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha1,
    #[default]
    Sha256,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    /// 다이제스트 원본 바이트
    pub fn digest_bytes(&self, content: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha1 => Sha1::digest(content).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(content).to_vec(),
        }
    }

    /// hex 인코딩된 다이제스트
    pub fn digest(&self, content: &[u8]) -> String {
        hex::encode(self.digest_bytes(content))
    }

    /// hex 다이제스트 길이로 알고리즘 추정 (MIC 헤더에는 알고리즘이 없다)
    pub fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            40 => Some(DigestAlgorithm::Sha1),
            64 => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }

    /// hex 다이제스트 비교 (대소문자 무시)
    pub fn verify(&self, content: &[u8], expected_hex: &str) -> bool {
        self.digest(content).eq_ignore_ascii_case(expected_hex.trim())
    }
}

/// 서명 다이제스트 알고리즘 (MD5는 호환용으로만 남김)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignAlgorithm {
    Md5,
    Sha1,
    #[default]
    Sha256,
}

impl SignAlgorithm {
    fn digest_algorithm(&self) -> Result<DigestAlgorithm, CryptoError> {
        match self {
            SignAlgorithm::Md5 => Err(CryptoError::Unsupported("md5")),
            SignAlgorithm::Sha1 => Ok(DigestAlgorithm::Sha1),
            SignAlgorithm::Sha256 => Ok(DigestAlgorithm::Sha256),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.digest_algorithm().is_ok()
    }
}

/// 암호화 알고리즘 (RC2, 3DES는 호환용으로만 남김)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptAlgorithm {
    Rc2,
    #[serde(rename = "3des")]
    TripleDes,
    #[default]
    #[serde(rename = "chacha20poly1305")]
    ChaCha20Poly1305,
}

impl EncryptAlgorithm {
    pub fn is_supported(&self) -> bool {
        matches!(self, EncryptAlgorithm::ChaCha20Poly1305)
    }

    fn ensure_supported(&self) -> Result<(), CryptoError> {
        match self {
            EncryptAlgorithm::Rc2 => Err(CryptoError::Unsupported("rc2")),
            EncryptAlgorithm::TripleDes => Err(CryptoError::Unsupported("3des")),
            EncryptAlgorithm::ChaCha20Poly1305 => Ok(()),
        }
    }
}

/// hex 문자열을 32바이트 키로 변환
pub fn decode_key(hex_key: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("key must be 32 bytes".into()))
}

/// 공개키 지문 (SHA-256, hex)
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// 로컬 노드 키 (서명 + 복호화)
pub struct LocalIdentity {
    signing: SigningKey,
    decryption: StaticSecret,
}

impl LocalIdentity {
    /// 새 키 생성
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            decryption: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// hex 시드에서 복원
    pub fn from_seeds(signing_seed: &str, decryption_seed: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            signing: SigningKey::from_bytes(&decode_key(signing_seed)?),
            decryption: StaticSecret::from(decode_key(decryption_seed)?),
        })
    }

    /// 설정에서 로드 (없는 키는 새로 생성)
    pub fn from_config(config: &IdentityConfig) -> Result<Self, CryptoError> {
        let signing = match &config.signing_key {
            Some(seed) => SigningKey::from_bytes(&decode_key(seed)?),
            None => SigningKey::generate(&mut OsRng),
        };
        let decryption = match &config.decryption_key {
            Some(seed) => StaticSecret::from(decode_key(seed)?),
            None => StaticSecret::random_from_rng(OsRng),
        };
        Ok(Self { signing, decryption })
    }

    /// 파트너에게 배포할 서명 검증키 (hex)
    pub fn verify_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    /// 파트너에게 배포할 암호화 공개키 (hex)
    pub fn encrypt_key_hex(&self) -> String {
        hex::encode(PublicKey::from(&self.decryption).as_bytes())
    }
}

/// 임시 키쌍 (세그먼트 하나를 봉인할 때 사용)
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// 새 임시 키쌍 생성
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// 공개키를 바이트로 변환
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// 상대방 공개키로 공유 비밀 계산 (소비됨)
    pub fn compute_shared_secret(self, peer_public: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 32] {
        let peer_public = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer_public);
        *shared.as_bytes()
    }
}

/// 세그먼트 암호화기
pub struct SegmentCipher {
    cipher: ChaCha20Poly1305,
    nonce_counter: u32,
}

impl SegmentCipher {
    /// 공유 비밀로 암호화기 생성
    pub fn new(shared_secret: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(shared_secret)),
            nonce_counter: 0,
        }
    }

    /// segment_no(8) + counter(4)
    fn generate_nonce(&mut self, segment_no: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&segment_no.to_le_bytes());
        nonce[8..].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter = self.nonce_counter.wrapping_add(1);
        nonce
    }

    /// 세그먼트 암호화
    /// 반환: nonce(12) + ciphertext(원본 + 16바이트 태그)
    pub fn encrypt_segment(&mut self, segment_no: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = self.generate_nonce(segment_no);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// 세그먼트 복호화
    /// 입력: nonce(12) + ciphertext
    pub fn decrypt_segment(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if encrypted.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("데이터가 너무 짧음".into()));
        }

        let nonce = Nonce::from_slice(&encrypted[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &encrypted[NONCE_SIZE..])
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

/// 서명된 내용
#[derive(Debug, Serialize, Deserialize)]
struct SignedContent {
    algorithm: SignAlgorithm,
    signature: Vec<u8>,
    content: Vec<u8>,
}

/// 암호화된 내용
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedContent {
    algorithm: EncryptAlgorithm,
    ephemeral_public: [u8; PUBLIC_KEY_SIZE],
    sealed: Vec<u8>,
}

fn envelope_error(e: bincode::Error) -> CryptoError {
    CryptoError::DecryptionFailed(format!("잘못된 보안 봉투: {e}"))
}

/// 세그먼트 본문에 파트너십 보안 정책 적용
pub struct SecurityTransform<'a> {
    identity: &'a LocalIdentity,
    partnership: &'a Partnership,
}

impl<'a> SecurityTransform<'a> {
    pub fn new(identity: &'a LocalIdentity, partnership: &'a Partnership) -> Self {
        Self { identity, partnership }
    }

    /// Ed25519 서명 (선택한 다이제스트 위에 서명)
    pub fn sign(&self, content: &[u8], algorithm: SignAlgorithm) -> Result<Vec<u8>, CryptoError> {
        let digest = algorithm.digest_algorithm()?.digest_bytes(content);
        let signature = self.identity.signing.sign(&digest);
        let envelope = SignedContent {
            algorithm,
            signature: signature.to_bytes().to_vec(),
            content: content.to_vec(),
        };
        bincode::serialize(&envelope).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// 파트너 공개키로 봉인
    pub fn encrypt(
        &self,
        segment_no: u64,
        content: &[u8],
        algorithm: EncryptAlgorithm,
    ) -> Result<Vec<u8>, CryptoError> {
        algorithm.ensure_supported()?;
        let partner_key = self.partner_encrypt_key()?;

        let keypair = EphemeralKeyPair::generate();
        let ephemeral_public = keypair.public_key_bytes();
        let shared = keypair.compute_shared_secret(&partner_key);
        let sealed = SegmentCipher::new(&shared).encrypt_segment(segment_no, content)?;

        let envelope = EncryptedContent {
            algorithm,
            ephemeral_public,
            sealed,
        };
        bincode::serialize(&envelope).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// 서명 후 암호화 (플래그가 모두 꺼져 있으면 그대로 반환)
    pub fn pack(&self, segment_no: u64, content: &[u8], sign: bool, encrypt: bool) -> Result<Vec<u8>, CryptoError> {
        let mut body = content.to_vec();
        if sign {
            body = self.sign(&body, self.partnership.sign_algorithm)?;
        }
        if encrypt {
            body = self.encrypt(segment_no, &body, self.partnership.encrypt_algorithm)?;
        }
        Ok(body)
    }

    /// 복호화 후 서명 검증
    pub fn unpack(&self, content: &[u8], signed: bool, encrypted: bool) -> Result<Vec<u8>, CryptoError> {
        if self.partnership.sign_requested && !signed {
            return Err(CryptoError::PolicyViolation("signature required".into()));
        }
        if self.partnership.encrypt_requested && !encrypted {
            return Err(CryptoError::PolicyViolation("encryption required".into()));
        }

        let mut body = content.to_vec();
        if encrypted {
            let envelope: EncryptedContent = bincode::deserialize(&body).map_err(envelope_error)?;
            envelope.algorithm.ensure_supported()?;
            let shared = self
                .identity
                .decryption
                .diffie_hellman(&PublicKey::from(envelope.ephemeral_public));
            body = SegmentCipher::new(shared.as_bytes()).decrypt_segment(&envelope.sealed)?;
        }
        if signed {
            let envelope: SignedContent = bincode::deserialize(&body).map_err(envelope_error)?;
            let digest = envelope.algorithm.digest_algorithm()?.digest_bytes(&envelope.content);
            let verifying = self.partner_verify_key()?;
            let signature = Signature::from_slice(&envelope.signature)
                .map_err(|_| CryptoError::SignatureMismatch)?;
            verifying
                .verify(&digest, &signature)
                .map_err(|_| CryptoError::SignatureMismatch)?;
            body = envelope.content;
        }
        Ok(body)
    }

    fn partner_encrypt_key(&self) -> Result<[u8; 32], CryptoError> {
        let hex_key = self
            .partnership
            .partner_encrypt_key
            .as_deref()
            .ok_or_else(|| CryptoError::InvalidKey("partner encryption key not configured".into()))?;
        let key = decode_key(hex_key)?;

        if let Some(expected) = &self.partnership.certificate_fingerprint {
            let actual = fingerprint(&key);
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(CryptoError::FingerprintMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(key)
    }

    fn partner_verify_key(&self) -> Result<VerifyingKey, CryptoError> {
        let hex_key = self
            .partnership
            .partner_verify_key
            .as_deref()
            .ok_or_else(|| CryptoError::InvalidKey("partner verify key not configured".into()))?;
        VerifyingKey::from_bytes(&decode_key(hex_key)?).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// alice -> bob 방향 파트너십 쌍
    fn partner_pair(alice: &LocalIdentity, bob: &LocalIdentity) -> (Partnership, Partnership) {
        let mut to_bob = Partnership::new("acme", "http://bob");
        to_bob.sign_requested = true;
        to_bob.encrypt_requested = true;
        to_bob.partner_encrypt_key = Some(bob.encrypt_key_hex());
        to_bob.partner_verify_key = Some(bob.verify_key_hex());

        let mut from_alice = Partnership::new("acme", "http://alice");
        from_alice.sign_requested = true;
        from_alice.encrypt_requested = true;
        from_alice.partner_encrypt_key = Some(alice.encrypt_key_hex());
        from_alice.partner_verify_key = Some(alice.verify_key_hex());
        (to_bob, from_alice)
    }

    #[test]
    fn test_key_exchange() {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();

        let alice_public = alice.public_key_bytes();
        let bob_public = bob.public_key_bytes();

        assert_eq!(
            alice.compute_shared_secret(&bob_public),
            bob.compute_shared_secret(&alice_public)
        );
    }

    #[test]
    fn test_sign_then_encrypt() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let (to_bob, from_alice) = partner_pair(&alice, &bob);

        let content: Vec<u8> = (0..65536).map(|i| (i % 256) as u8).collect();
        let sealed = SecurityTransform::new(&alice, &to_bob)
            .pack(3, &content, true, true)
            .unwrap();
        assert_ne!(sealed, content);

        let opened = SecurityTransform::new(&bob, &from_alice)
            .unpack(&sealed, true, true)
            .unwrap();
        assert_eq!(opened, content);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let mallory = LocalIdentity::generate();
        let (_, from_alice) = partner_pair(&alice, &bob);

        // 다른 키로 서명된 내용
        let mut to_bob = Partnership::new("acme", "http://bob");
        to_bob.partner_encrypt_key = Some(bob.encrypt_key_hex());
        let forged = SecurityTransform::new(&mallory, &to_bob)
            .pack(1, b"forged", true, true)
            .unwrap();

        let result = SecurityTransform::new(&bob, &from_alice).unpack(&forged, true, true);
        assert!(matches!(result, Err(CryptoError::SignatureMismatch)));
    }

    #[test]
    fn test_policy_requires_security() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let (_, from_alice) = partner_pair(&alice, &bob);

        let result = SecurityTransform::new(&bob, &from_alice).unpack(b"plain", false, false);
        assert!(matches!(result, Err(CryptoError::PolicyViolation(_))));
    }

    #[test]
    fn test_legacy_algorithms_rejected() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let (to_bob, _) = partner_pair(&alice, &bob);
        let transform = SecurityTransform::new(&alice, &to_bob);

        assert!(matches!(
            transform.sign(b"x", SignAlgorithm::Md5),
            Err(CryptoError::Unsupported("md5"))
        ));
        assert!(matches!(
            transform.encrypt(1, b"x", EncryptAlgorithm::TripleDes),
            Err(CryptoError::Unsupported("3des"))
        ));
    }

    #[test]
    fn test_fingerprint_checked_before_encrypt() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let (mut to_bob, _) = partner_pair(&alice, &bob);

        to_bob.certificate_fingerprint = Some("00".repeat(32));
        let result = SecurityTransform::new(&alice, &to_bob).pack(1, b"x", false, true);
        assert!(matches!(result, Err(CryptoError::FingerprintMismatch { .. })));

        let key = decode_key(&bob.encrypt_key_hex()).unwrap();
        to_bob.certificate_fingerprint = Some(fingerprint(&key));
        assert!(SecurityTransform::new(&alice, &to_bob).pack(1, b"x", false, true).is_ok());
    }

    #[test]
    fn test_mic_digest() {
        assert_eq!(
            DigestAlgorithm::Sha256.digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            DigestAlgorithm::Sha1.digest(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        let mic = DigestAlgorithm::Sha1.digest(b"abc").to_uppercase();
        let algorithm = DigestAlgorithm::from_hex_len(mic.len()).unwrap();
        assert_eq!(algorithm, DigestAlgorithm::Sha1);
        assert!(algorithm.verify(b"abc", &mic));
        assert!(!algorithm.verify(b"abd", &mic));
        assert_eq!(DigestAlgorithm::from_hex_len(32), None);
    }
}
