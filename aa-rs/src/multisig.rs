use crate::entrypoint::EntryPointDef;
use crate::error::{AaError, Result};
use crate::types::{GasValues, UserOperationRequest};
use ethers::types::{Address, Bytes, H256, U256};

/// Index byte carried by the last (primary) member signature.
pub const PRIMARY_SIGNATURE_INDEX: u8 = 255;

/// Bytes taken by the three upper-limit gas words.
pub const UPPER_LIMITS_LEN: usize = 96;

/// Added to an EOA signature's `v` when it covers the actual gas values.
const ACTUAL_GAS_V_OFFSET: u8 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignerType {
    Eoa,
    Contract,
}

/// Which gas values a member signature commits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserOpSigType {
    Actual,
    UpperLimit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub signer_type: SignerType,
    pub user_op_sig_type: UserOpSigType,
    pub signer: Address,
    pub signature: Bytes,
}

/// The request with its three gas values swapped for the upper limits.
pub fn upper_limit_request(request: &UserOperationRequest, limits: GasValues) -> UserOperationRequest {
    request.with_gas_values(limits)
}

/// Hash a member signs: over the request as is for `Actual`, over the
/// upper-limit variant for `UpperLimit`.
pub fn member_signature_hash(
    entry_point: &EntryPointDef,
    request: &UserOperationRequest,
    limits: GasValues,
    sig_type: UserOpSigType,
) -> Result<H256> {
    match sig_type {
        UserOpSigType::Actual => entry_point.hash(request),
        UserOpSigType::UpperLimit => entry_point.hash(&upper_limit_request(request, limits)),
    }
}

/// Member signature in the form the account's validation expects.
///
/// EOA: the 65-byte `r ++ s ++ v`, with 32 added to `v` for actual-gas signatures.
/// Contract: `signer ++ flag ++ signature`, flag 32 for actual-gas and 0 otherwise.
pub fn format_member_signature(sig: &Signature) -> Result<Vec<u8>> {
    let actual = sig.user_op_sig_type == UserOpSigType::Actual;
    match sig.signer_type {
        SignerType::Eoa => {
            if sig.signature.len() != 65 {
                return Err(AaError::InvalidSignature(format!(
                    "EOA signature from {:?} is {} bytes, expected 65",
                    sig.signer,
                    sig.signature.len()
                )));
            }
            let mut out = sig.signature.to_vec();
            if actual {
                let v = out[64];
                out[64] = v
                    .checked_add(ACTUAL_GAS_V_OFFSET)
                    .ok_or_else(|| AaError::InvalidSignature(format!("v out of range: {v}")))?;
            }
            Ok(out)
        }
        SignerType::Contract => {
            let mut out = Vec::with_capacity(21 + sig.signature.len());
            out.extend_from_slice(sig.signer.as_bytes());
            out.push(if actual { ACTUAL_GAS_V_OFFSET } else { 0 });
            out.extend_from_slice(&sig.signature);
            Ok(out)
        }
    }
}

/// `pad32(pvg) ++ pad32(maxFee) ++ pad32(maxPriorityFee)` followed by every
/// member entry in input order.
///
/// Each entry is `uint32(len(content) + 1) ++ uint8(index) ++ content`. Entries
/// are indexed by position, except the last, which carries [`PRIMARY_SIGNATURE_INDEX`].
pub fn combine_signatures(upper_limits: GasValues, signatures: &[Signature]) -> Result<Bytes> {
    if signatures.is_empty() {
        return Err(AaError::InvalidSignature("no member signatures".into()));
    }
    if signatures.len() > PRIMARY_SIGNATURE_INDEX as usize {
        return Err(AaError::InvalidSignature(format!(
            "{} member signatures exceed the index space",
            signatures.len()
        )));
    }

    let mut out = Vec::with_capacity(UPPER_LIMITS_LEN + signatures.len() * 70);
    for v in [
        upper_limits.pre_verification_gas,
        upper_limits.max_fee_per_gas,
        upper_limits.max_priority_fee_per_gas,
    ] {
        out.extend_from_slice(&word(v));
    }

    let last = signatures.len() - 1;
    for (i, sig) in signatures.iter().enumerate() {
        let content = format_member_signature(sig)?;
        let index = if i == last {
            PRIMARY_SIGNATURE_INDEX
        } else {
            i as u8
        };
        let len = u32::try_from(content.len() + 1).map_err(|_| {
            AaError::InvalidSignature(format!("signature from {:?} too long", sig.signer))
        })?;
        out.extend_from_slice(&len.to_be_bytes());
        out.push(index);
        out.extend_from_slice(&content);
    }
    Ok(Bytes::from(out))
}

/// One entry read back from a combined signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberEntry {
    pub index: u8,
    pub content: Bytes,
}

/// Inverse of [`combine_signatures`]: the upper limits and the raw member entries.
pub fn split_combined_signature(combined: &[u8]) -> Result<(GasValues, Vec<MemberEntry>)> {
    if combined.len() < UPPER_LIMITS_LEN {
        return Err(AaError::InvalidSignature(format!(
            "combined signature is {} bytes, shorter than the upper limits",
            combined.len()
        )));
    }
    let limits = GasValues {
        pre_verification_gas: U256::from_big_endian(&combined[..32]),
        max_fee_per_gas: U256::from_big_endian(&combined[32..64]),
        max_priority_fee_per_gas: U256::from_big_endian(&combined[64..96]),
    };

    let mut entries = Vec::new();
    let mut rest = &combined[UPPER_LIMITS_LEN..];
    while !rest.is_empty() {
        if rest.len() < 5 {
            return Err(AaError::InvalidSignature("truncated member header".into()));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len == 0 || rest.len() < 4 + len {
            return Err(AaError::InvalidSignature(format!(
                "member entry length {len} overruns the signature"
            )));
        }
        entries.push(MemberEntry {
            index: rest[4],
            content: Bytes::from(rest[5..4 + len].to_vec()),
        });
        rest = &rest[4 + len..];
    }
    Ok((limits, entries))
}

fn word(v: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    v.to_big_endian(&mut out);
    out
}
