use alloy::primitives::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ResolveError, Result};

/// First four bytes of `keccak256(signature)`, the EVM function dispatch key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Selector([u8; 4]);

impl Selector {
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Create a selector by hashing a function signature.
    pub fn from_signature(sig: &str) -> Self {
        let hash = keccak256(sig.as_bytes());
        Self([hash[0], hash[1], hash[2], hash[3]])
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({})", self)
    }
}

const OP_PUSH1: u8 = 0x60;
const OP_PUSH4: u8 = 0x63;
const OP_PUSH32: u8 = 0x7f;
const OP_EQ: u8 = 0x14;
const OP_GT: u8 = 0x11;
const OP_LT: u8 = 0x10;
const OP_DUP1: u8 = 0x80;

/// Derives the set of 4-byte function selectors present in runtime bytecode.
///
/// Walks the bytecode opcode by opcode, skipping push-data bytes so that
/// selector-like constants embedded inside larger pushes are not misread, and
/// records `PUSH4` operands that participate in a dispatcher comparison
/// (`DUP1 PUSH4 ... EQ` and the `GT`/`LT` splits of binary-search
/// dispatchers). Order of first appearance is preserved; duplicates are
/// dropped.
pub fn extract_selectors(bytecode_hex: &str) -> Result<Vec<Selector>> {
    let trimmed = bytecode_hex.trim().trim_start_matches("0x");
    let bytecode = hex::decode(trimmed)
        .map_err(|e| ResolveError::Rpc(format!("invalid bytecode hex: {}", e)))?;

    let mut selectors: Vec<Selector> = Vec::new();
    let mut preceded_by_dup1 = false;
    let mut i = 0usize;

    while i < bytecode.len() {
        let op = bytecode[i];

        if (OP_PUSH1..=OP_PUSH32).contains(&op) {
            let push_len = (op - OP_PUSH1 + 1) as usize;
            let data_end = i + 1 + push_len;

            if op == OP_PUSH4 && data_end <= bytecode.len() {
                let operand = [
                    bytecode[i + 1],
                    bytecode[i + 2],
                    bytecode[i + 3],
                    bytecode[i + 4],
                ];
                let next_op = bytecode.get(data_end).copied();
                let dispatch_shape = matches!(next_op, Some(OP_EQ | OP_GT | OP_LT))
                    || preceded_by_dup1;

                if dispatch_shape && operand != [0u8; 4] && operand != [0xff; 4] {
                    let selector = Selector::from_bytes(operand);
                    if !selectors.contains(&selector) {
                        selectors.push(selector);
                    }
                }
            }

            preceded_by_dup1 = false;
            i = data_end;
            continue;
        }

        preceded_by_dup1 = op == OP_DUP1;
        i += 1;
    }

    Ok(selectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The canonical dispatcher stanza emitted by solc:
    /// `DUP1 PUSH4 <sel> EQ PUSH2 <dest> JUMPI`.
    fn dispatch_stanza(selector: [u8; 4]) -> Vec<u8> {
        let mut code = vec![OP_DUP1, OP_PUSH4];
        code.extend_from_slice(&selector);
        code.extend_from_slice(&[OP_EQ, 0x61, 0x00, 0x40, 0x57]);
        code
    }

    #[test]
    fn test_extracts_selectors_from_dispatcher() {
        let transfer = Selector::from_signature("transfer(address,uint256)");
        let balance_of = Selector::from_signature("balanceOf(address)");

        let mut code = vec![0x60, 0x80, 0x60, 0x40, 0x52]; // preamble
        code.extend(dispatch_stanza(*transfer.as_bytes()));
        code.extend(dispatch_stanza(*balance_of.as_bytes()));

        let selectors = extract_selectors(&format!("0x{}", hex::encode(code))).unwrap();
        assert_eq!(selectors, vec![transfer, balance_of]);
    }

    #[test]
    fn test_push4_inside_push32_data_is_skipped() {
        // PUSH32 whose data happens to contain a PUSH4/EQ lookalike.
        let mut code = vec![OP_PUSH32];
        code.extend_from_slice(&[OP_PUSH4, 0xa9, 0x05, 0x9c, 0xbb, OP_EQ]);
        code.extend_from_slice(&[0u8; 26]);
        code.push(0x00); // STOP

        let selectors = extract_selectors(&hex::encode(code)).unwrap();
        assert!(selectors.is_empty());
    }

    #[test]
    fn test_duplicate_selectors_collapse() {
        let sel = Selector::from_signature("approve(address,uint256)");
        let mut code = dispatch_stanza(*sel.as_bytes());
        code.extend(dispatch_stanza(*sel.as_bytes()));

        let selectors = extract_selectors(&hex::encode(code)).unwrap();
        assert_eq!(selectors, vec![sel]);
    }

    #[test]
    fn test_sentinel_operands_are_ignored() {
        let mut code = dispatch_stanza([0u8; 4]);
        code.extend(dispatch_stanza([0xff; 4]));

        let selectors = extract_selectors(&hex::encode(code)).unwrap();
        assert!(selectors.is_empty());
    }

    #[test]
    fn test_empty_bytecode_yields_no_selectors() {
        assert!(extract_selectors("0x").unwrap().is_empty());
    }

    #[test]
    fn test_selector_display() {
        let sel = Selector::from_bytes([0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(sel.to_string(), "0xa9059cbb");
    }
}
