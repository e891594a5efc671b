//! Gateway service operations. Every mutating operation follows the same
//! contract: validate, take the per-subsystem lock, read the affected state
//! map records, apply locally-owned changes to the engine first (everything
//! else goes to the state map first), then CAS the new record. CAS conflicts
//! rerun the whole read-validate-write cycle a bounded number of times.

pub mod connection;
pub mod host;
pub mod listener;
pub mod namespace;
pub mod subsystem;

use crate::{context::GwContext, error::SvcError, state::keys::StateKey};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::future::Future;
use std::time::Duration;

/// CAS conflicts retried before `Aborted` reaches the caller.
const CAS_RETRIES: u32 = 3;

/// Rerun `op` on a CAS conflict, up to `CAS_RETRIES` times with a short
/// random delay so two racing gateways do not collide again in lockstep.
pub(crate) async fn with_cas_retry<T, F, Fut>(op: F) -> Result<T, SvcError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, SvcError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(SvcError::Conflict { key }) if attempt < CAS_RETRIES => {
                attempt += 1;
                let jitter_ms = rand::thread_rng().gen_range(50 ..= 250);
                tracing::debug!(
                    "CAS conflict on '{}', retry {}/{} in {}ms",
                    key,
                    attempt,
                    CAS_RETRIES,
                    jitter_ms
                );
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }
            other => return other,
        }
    }
}

/// Run the engine-apply step of a mutation whose state map write already
/// succeeded. On failure the key is marked pending so the reconciler keeps
/// converging the local engine, and the engine error still reaches the
/// caller.
pub(crate) async fn engine_apply<T, F, Fut>(
    ctx: &GwContext,
    key: &StateKey,
    op: F,
) -> Result<T, SvcError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, crate::tgt::TgtError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) => {
            ctx.pending.mark(key.to_string());
            Err(err.into())
        }
    }
}

static NQN_RE: Lazy<Regex> = Lazy::new(|| {
    // nqn.yyyy-mm.reverse.domain[:user-suffix]
    Regex::new(r"^nqn\.\d{4}-\d{2}\.[a-zA-Z][a-zA-Z0-9.\-]*(:[\x21-\x7e]+)?$")
        .expect("static regex")
});

/// Longest NQN the fabric allows.
const NQN_MAX_LEN: usize = 223;

/// Validate a subsystem or host NQN.
pub fn validate_nqn(nqn: &str) -> Result<(), SvcError> {
    if nqn.len() > NQN_MAX_LEN {
        return Err(SvcError::InvalidNqn {
            nqn: nqn.to_string(),
            reason: format!("longer than {} characters", NQN_MAX_LEN),
        });
    }
    if nqn.contains('/') {
        return Err(SvcError::InvalidNqn {
            nqn: nqn.to_string(),
            reason: "'/' is not allowed".to_string(),
        });
    }
    if !NQN_RE.is_match(nqn) {
        return Err(SvcError::InvalidNqn {
            nqn: nqn.to_string(),
            reason: "not in 'nqn.yyyy-mm.reverse.domain:identifier' form"
                .to_string(),
        });
    }
    Ok(())
}

/// Validate a host NQN, which may also be the `"*"` wildcard.
pub fn validate_host_nqn(host_nqn: &str) -> Result<(), SvcError> {
    if host_nqn == "*" {
        return Ok(());
    }
    validate_nqn(host_nqn)
}

/// Validate that the transport address matches the address family.
pub fn validate_traddr(
    traddr: &str,
    adrfam: crate::state::records::AddressFamily,
) -> Result<(), SvcError> {
    use crate::state::records::AddressFamily;
    let ok = match adrfam {
        AddressFamily::Ipv4 => traddr.parse::<std::net::Ipv4Addr>().is_ok(),
        AddressFamily::Ipv6 => traddr.parse::<std::net::Ipv6Addr>().is_ok(),
    };
    if !ok {
        return Err(SvcError::InvalidArguments {
            details: format!(
                "transport address '{}' is not a valid {} address",
                traddr, adrfam
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::records::AddressFamily;
    use assert_matches::assert_matches;

    #[test]
    fn nqn_validation() {
        assert!(validate_nqn("nqn.2016-06.io.spdk:cnode1").is_ok());
        assert!(validate_nqn(
            "nqn.2014-08.org.nvmexpress:uuid:7c1a1f0e-9fd6-4a96-b8f0-1f6ee906ec1c"
        )
        .is_ok());
        assert_matches!(
            validate_nqn("bogus"),
            Err(SvcError::InvalidNqn { .. })
        );
        assert_matches!(
            validate_nqn("nqn.16-06.io.spdk:cnode1"),
            Err(SvcError::InvalidNqn { .. })
        );
        assert_matches!(
            validate_nqn("nqn.2016-06.io.spdk/cnode1"),
            Err(SvcError::InvalidNqn { .. })
        );
        let long = format!("nqn.2016-06.io.spdk:{}", "x".repeat(250));
        assert_matches!(
            validate_nqn(&long),
            Err(SvcError::InvalidNqn { .. })
        );
    }

    #[test]
    fn host_nqn_allows_wildcard() {
        assert!(validate_host_nqn("*").is_ok());
        assert!(validate_host_nqn("nqn.2016-06.io.spdk:host1").is_ok());
        assert!(validate_host_nqn("**").is_err());
    }

    #[test]
    fn traddr_family_match() {
        assert!(validate_traddr("192.168.13.3", AddressFamily::Ipv4).is_ok());
        assert!(validate_traddr("::1", AddressFamily::Ipv6).is_ok());
        assert_matches!(
            validate_traddr("::1", AddressFamily::Ipv4),
            Err(SvcError::InvalidArguments { .. })
        );
        assert_matches!(
            validate_traddr("not-an-ip", AddressFamily::Ipv4),
            Err(SvcError::InvalidArguments { .. })
        );
    }

    #[tokio::test]
    async fn cas_retry_gives_up_with_aborted() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let res: Result<(), SvcError> = with_cas_retry(|| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async {
                Err(SvcError::Conflict {
                    key: "sub/x".to_string(),
                })
            }
        })
        .await;
        assert_matches!(res, Err(SvcError::Conflict { .. }));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cas_retry_succeeds_after_conflict() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let res: Result<u32, SvcError> = with_cas_retry(|| {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(SvcError::Conflict {
                        key: "sub/x".to_string(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 7);
    }
}
