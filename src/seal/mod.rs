//! Seal-Token Validator (C2) — parses wallet-scoped bearer tokens,
//! cross-checks stake on the ledger, and derives the permission set.

mod cache;
mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::ledger::{LedgerAdapter, ObjectState};
use crate::model::{permissions_for_stake, Permission, SealToken, WalletAddress, SEAL_TOKEN_MIN_LEN, SEAL_TOKEN_PREFIX};

use cache::{SingleFlight, ValidationCache};
use rate_limit::FailureRateLimiter;

const ISSUED_AT_SKEW: ChronoDuration = ChronoDuration::seconds(30);

/// Wire-format payload encoded after the `seal_` prefix: base64url(json).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealTokenWire {
    wallet_address: WalletAddress,
    signature: String,
    challenge: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    stake_amount: u64,
}

/// Authoritative stake status as observed on the ledger at validation time.
#[derive(Debug, Clone)]
pub struct StakeInfo {
    pub stake_amount: u64,
    pub active: bool,
    pub public_key: [u8; 32],
}

/// Abstraction over "ask the ledger for current stake", so C2 depends only
/// on this trait and never on C1's concrete adapter type.
#[async_trait::async_trait]
pub trait StakeSource: Send + Sync {
    async fn stake_status(&self, wallet: &WalletAddress) -> Result<StakeInfo, BridgeError>;
}

/// Any [`LedgerAdapter`] can answer stake queries by reading the wallet's
/// contract-owned object.
pub struct LedgerStakeSource<L: LedgerAdapter> {
    ledger: Arc<L>,
}

impl<L: LedgerAdapter> LedgerStakeSource<L> {
    pub fn new(ledger: Arc<L>) -> Self {
        Self { ledger }
    }
}

#[async_trait::async_trait]
impl<L: LedgerAdapter> StakeSource for LedgerStakeSource<L> {
    async fn stake_status(&self, wallet: &WalletAddress) -> Result<StakeInfo, BridgeError> {
        match self.ledger.query_object(wallet).await? {
            ObjectState::NotFound => Err(BridgeError::StakeInactive),
            ObjectState::Found(value) => {
                let stake_amount = value
                    .get("stake_amount")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| BridgeError::Malformed("wallet object missing stake_amount".to_string()))?;
                let active = value
                    .get("status")
                    .and_then(|v| v.as_str())
                    .map(|s| s == "active")
                    .unwrap_or(false);
                let public_key_hex = value
                    .get("public_key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| BridgeError::Malformed("wallet object missing public_key".to_string()))?;
                let bytes = hex::decode(public_key_hex)
                    .map_err(|e| BridgeError::Malformed(format!("invalid public_key hex: {e}")))?;
                let public_key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| BridgeError::Malformed("public_key must be 32 bytes".to_string()))?;

                Ok(StakeInfo {
                    stake_amount,
                    active,
                    public_key,
                })
            }
        }
    }
}

/// Parse the wire-format bearer string into its semantic fields, applying
/// only the structural checks from §4.2.1 (prefix, length, required
/// fields, expiry/skew). Does not touch the ledger.
pub fn parse_seal_token(raw: &str) -> Result<SealToken, BridgeError> {
    let payload = raw
        .strip_prefix(SEAL_TOKEN_PREFIX)
        .ok_or_else(|| BridgeError::Malformed("missing seal_ prefix".to_string()))?;

    if payload.len() < SEAL_TOKEN_MIN_LEN {
        return Err(BridgeError::Malformed("token too short".to_string()));
    }

    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| BridgeError::Malformed(format!("invalid base64: {e}")))?;
    let wire: SealTokenWire = serde_json::from_slice(&decoded)
        .map_err(|e| BridgeError::Malformed(format!("invalid token payload: {e}")))?;

    if wire.wallet_address.is_empty() || wire.signature.is_empty() || wire.challenge.is_empty() {
        return Err(BridgeError::Malformed("missing required field".to_string()));
    }

    let now = Utc::now();
    if wire.expires_at <= now {
        return Err(BridgeError::Expired);
    }
    if wire.issued_at > now + ISSUED_AT_SKEW {
        return Err(BridgeError::Malformed("issued_at is in the future".to_string()));
    }

    Ok(SealToken {
        wallet_address: wire.wallet_address,
        signature: wire.signature,
        challenge: wire.challenge,
        issued_at: wire.issued_at,
        expires_at: wire.expires_at,
        stake_amount: wire.stake_amount,
        permissions: Vec::new(),
    })
}

/// Wallet-bound signature check: `signature` must verify over
/// `challenge || issued_at || wallet_address` under the wallet's
/// on-ledger public key. This resolves the open question in spec.md §9 —
/// the structural parser above never trusted the signature bytes for
/// anything beyond "present and well-formed hex".
fn verify_signature(token: &SealToken, public_key: &[u8; 32]) -> Result<(), BridgeError> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| BridgeError::Malformed(format!("invalid wallet public key: {e}")))?;

    let signature_bytes = hex::decode(&token.signature)
        .map_err(|e| BridgeError::Malformed(format!("invalid signature hex: {e}")))?;
    let signature_array: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| BridgeError::Malformed("signature must be 64 bytes".to_string()))?;
    let signature = Signature::from_bytes(&signature_array);

    let mut message = Vec::new();
    message.extend_from_slice(token.challenge.as_bytes());
    message.extend_from_slice(token.issued_at.to_rfc3339().as_bytes());
    message.extend_from_slice(token.wallet_address.as_bytes());

    verifying_key
        .verify(&message, &signature)
        .map_err(|_| BridgeError::Malformed("signature verification failed".to_string()))
}

/// Full C2 pipeline: structural parse -> signature check -> ledger stake
/// lookup -> permission derivation, with a TTL cache and a single-flight
/// lock on the miss path.
pub struct SealTokenValidator<S: StakeSource> {
    stake_source: Arc<S>,
    cache: ValidationCache,
    single_flight: SingleFlight,
    failure_limiter: FailureRateLimiter,
    min_user_stake: u64,
    min_admin_stake: u64,
    seal_cache_ttl: Duration,
}

impl<S: StakeSource> SealTokenValidator<S> {
    pub fn new(stake_source: Arc<S>, min_user_stake: u64, seal_cache_ttl: Duration) -> Self {
        Self::with_admin_tier(stake_source, min_user_stake, 10 * crate::model::SUI, seal_cache_ttl)
    }

    /// `min_admin_stake` parametrizes the wildcard-permission tier's
    /// threshold (§3/§6); every other tier boundary is fixed by the data
    /// model.
    pub fn with_admin_tier(
        stake_source: Arc<S>,
        min_user_stake: u64,
        min_admin_stake: u64,
        seal_cache_ttl: Duration,
    ) -> Self {
        Self {
            stake_source,
            cache: ValidationCache::new(),
            single_flight: SingleFlight::new(),
            failure_limiter: FailureRateLimiter::new(60),
            min_user_stake,
            min_admin_stake,
            seal_cache_ttl,
        }
    }

    /// Validate a raw bearer string end to end, returning the derived
    /// permission set on success.
    pub async fn validate(&self, raw: &str) -> Result<(SealToken, Vec<Permission>), BridgeError> {
        let mut token = parse_seal_token(raw)?;

        if !self.failure_limiter.check(&token.wallet_address) {
            return Err(BridgeError::Malformed(
                "too many failed validation attempts for this wallet".to_string(),
            ));
        }

        let cache_key = cache::key(&token.wallet_address, &token.signature);
        if let Some(cached) = self.cache.get(&cache_key) {
            debug!(wallet = %token.wallet_address, "seal token served from cache");
            token.permissions = cached.clone();
            return Ok((token, cached));
        }

        // Miss: serialize concurrent validations of the same token behind a
        // per-key lock so only one fires the ledger query; the rest
        // re-check the cache once they acquire the guard and find it
        // already populated by whichever waiter went first.
        let _flight_guard = self.single_flight.guard(&cache_key).await;
        if let Some(cached) = self.cache.get(&cache_key) {
            debug!(wallet = %token.wallet_address, "seal token served from cache after single-flight wait");
            token.permissions = cached.clone();
            drop(_flight_guard);
            self.single_flight.release(&cache_key);
            return Ok((token, cached));
        }

        let result = self.validate_uncached(&token).await;
        drop(_flight_guard);
        self.single_flight.release(&cache_key);
        match result {
            Ok(permissions) => {
                let ttl = self.seal_cache_ttl.min(Duration::from_secs(
                    (token.expires_at - Utc::now()).num_seconds().max(0) as u64,
                ));
                self.cache.put(cache_key, permissions.clone(), ttl);
                token.permissions = permissions.clone();
                Ok((token, permissions))
            }
            Err(BridgeError::LedgerUnavailable(msg)) => {
                if let Some(stale) = self.cache.get_stale(&cache_key) {
                    warn!(wallet = %token.wallet_address, "ledger unavailable, serving stale cache entry");
                    token.permissions = stale.clone();
                    Ok((token, stale))
                } else {
                    self.failure_limiter.record_failure(&token.wallet_address);
                    Err(BridgeError::LedgerUnavailable(msg))
                }
            }
            Err(other) => {
                self.failure_limiter.record_failure(&token.wallet_address);
                Err(other)
            }
        }
    }

    async fn validate_uncached(&self, token: &SealToken) -> Result<Vec<Permission>, BridgeError> {
        let stake_info = self.stake_source.stake_status(&token.wallet_address).await?;

        verify_signature(token, &stake_info.public_key)?;

        if !stake_info.active {
            return Err(BridgeError::StakeInactive);
        }
        if stake_info.stake_amount < self.min_user_stake {
            return Err(BridgeError::StakeInsufficient {
                have: stake_info.stake_amount,
                need: self.min_user_stake,
            });
        }

        Ok(permissions_for_stake(stake_info.stake_amount, self.min_admin_stake).into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SUI;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    struct FixedStakeSource {
        info: StakeInfo,
    }

    #[async_trait::async_trait]
    impl StakeSource for FixedStakeSource {
        async fn stake_status(&self, _wallet: &WalletAddress) -> Result<StakeInfo, BridgeError> {
            Ok(self.info.clone())
        }
    }

    fn encode_token(wire: &SealTokenWire) -> String {
        let json = serde_json::to_vec(wire).unwrap();
        format!("{SEAL_TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(json))
    }

    fn signed_token(signing_key: &SigningKey, wallet: &str, stake: u64) -> String {
        let issued_at = Utc::now();
        let challenge = "chal-1".to_string();
        let mut message = Vec::new();
        message.extend_from_slice(challenge.as_bytes());
        message.extend_from_slice(issued_at.to_rfc3339().as_bytes());
        message.extend_from_slice(wallet.as_bytes());
        let signature = signing_key.sign(&message);

        let wire = SealTokenWire {
            wallet_address: wallet.to_string(),
            signature: hex::encode(signature.to_bytes()),
            challenge,
            issued_at,
            expires_at: issued_at + ChronoDuration::minutes(5),
            stake_amount: stake,
        };
        encode_token(&wire)
    }

    #[tokio::test]
    async fn valid_token_with_sufficient_stake_is_admitted() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();
        let raw = signed_token(&signing_key, "0xabc", SUI);

        let validator = SealTokenValidator::new(
            Arc::new(FixedStakeSource {
                info: StakeInfo {
                    stake_amount: SUI,
                    active: true,
                    public_key,
                },
            }),
            SUI / 2,
            Duration::from_secs(300),
        );

        let (_, permissions) = validator.validate(&raw).await.unwrap();
        assert!(permissions.contains(&Permission::new("nodes", "write")));
    }

    #[tokio::test]
    async fn insufficient_stake_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();
        let raw = signed_token(&signing_key, "0xabc", SUI / 4);

        let validator = SealTokenValidator::new(
            Arc::new(FixedStakeSource {
                info: StakeInfo {
                    stake_amount: SUI / 4,
                    active: true,
                    public_key,
                },
            }),
            SUI / 2,
            Duration::from_secs(300),
        );

        let result = validator.validate(&raw).await;
        assert!(matches!(result, Err(BridgeError::StakeInsufficient { .. })));
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let other_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();
        let raw = signed_token(&other_key, "0xabc", SUI);

        let validator = SealTokenValidator::new(
            Arc::new(FixedStakeSource {
                info: StakeInfo {
                    stake_amount: SUI,
                    active: true,
                    public_key,
                },
            }),
            SUI / 2,
            Duration::from_secs(300),
        );

        let result = validator.validate(&raw).await;
        assert!(result.is_err());
    }

    #[test]
    fn missing_prefix_is_malformed() {
        assert!(matches!(parse_seal_token("nope"), Err(BridgeError::Malformed(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let issued_at = Utc::now() - ChronoDuration::minutes(10);
        let wire = SealTokenWire {
            wallet_address: "0xabc".to_string(),
            signature: hex::encode([0u8; 64]),
            challenge: "c".to_string(),
            issued_at,
            expires_at: issued_at,
            stake_amount: 0,
        };
        let raw = encode_token(&wire);
        assert!(matches!(parse_seal_token(&raw), Err(BridgeError::Expired)));
    }
}
