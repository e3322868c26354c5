//! One-time crypto runtime initialization.
//!
//! [`init`] runs a self-test of the random source and every AEAD profile the
//! first time it is called and caches the outcome for the life of the
//! process. A failed self-test is fatal: every later call returns the same
//! `CryptoInit` error and no engine can be constructed.

use std::sync::OnceLock;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{error, info};

use crate::aead::{open, seal, AeadAlgorithm};
use crate::keys::KEY_LENGTH;
use lockbox_common::{Error, Result};

static STATE: OnceLock<std::result::Result<(), String>> = OnceLock::new();

const SELF_TEST_PLAINTEXT: &[u8] = b"lockbox-self-test";

/// Initialize the crypto runtime. Idempotent.
///
/// # Errors
/// - `CryptoInit` if the self-test failed, now or on an earlier call
pub fn init() -> Result<()> {
    STATE
        .get_or_init(|| {
            let outcome = self_test();
            match &outcome {
                Ok(()) => info!("Crypto runtime initialized"),
                Err(reason) => error!("Crypto self-test failed: {}", reason),
            }
            outcome
        })
        .clone()
        .map_err(Error::CryptoInit)
}

/// Whether [`init`] has run and succeeded.
pub fn is_initialized() -> bool {
    matches!(STATE.get(), Some(Ok(())))
}

fn self_test() -> std::result::Result<(), String> {
    let mut a = [0u8; KEY_LENGTH];
    let mut b = [0u8; KEY_LENGTH];
    OsRng
        .try_fill_bytes(&mut a)
        .and_then(|_| OsRng.try_fill_bytes(&mut b))
        .map_err(|e| format!("random source unavailable: {}", e))?;
    if a == b || a.iter().all(|&x| x == 0) {
        return Err("random source returned degenerate output".to_string());
    }

    for algorithm in AeadAlgorithm::ALL {
        let nonce = vec![0x24u8; algorithm.nonce_len()];
        let sealed = seal(algorithm, &a, &nonce, SELF_TEST_PLAINTEXT)
            .map_err(|e| format!("{} seal: {}", algorithm, e))?;
        let opened = open(algorithm, &a, &nonce, &sealed)
            .map_err(|e| format!("{} open: {}", algorithm, e))?;
        if opened != SELF_TEST_PLAINTEXT {
            return Err(format!("{} round-trip mismatch", algorithm));
        }
        if open(algorithm, &b, &nonce, &sealed).is_ok() {
            return Err(format!("{} accepted the wrong key", algorithm));
        }
    }
    Ok(())
}
