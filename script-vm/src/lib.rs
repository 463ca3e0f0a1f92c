// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! A stack-based interpreter that evaluates an input's signature script
//! concatenated with the previous output's control script, failing
//! unless the resulting stack top is truthy (§4.3 "Script VM").
//!
//! Execution is deterministic and bounded by a [`RunLimit`] decremented
//! per instruction (§4.3's cost table, supplemented per SPEC_FULL §C).
//! Opcodes reserved for a future chain version always fail under the
//! current one, preserving forward-compatibility (§9 "Script VM
//! evolution").

pub mod opcode;

use chain_crypto::{verify_multisig, HashValue, PublicKey, Signature};
use chain_failure_ext::{ChainErrorKind, Result};
use chain_logger::prelude::*;
pub use opcode::Opcode;
use std::convert::TryFrom;

/// The chain's current script-language version. Opcodes whose semantics
/// are reserved for a later version always fail under this one (§4.3,
/// §9 "Script VM evolution").
pub const CURRENT_VERSION: u8 = 1;

/// Baseline cost of any single instruction.
const BASELINE_COST: u64 = 1;
/// Additional cost per byte of data pushed onto the stack.
const PUSH_BYTE_COST: u64 = 1;
/// Signature verification (and the point multiplication it implies) is
/// far more expensive than bookkeeping ops.
const CHECKSIG_COST: u64 = 100;
/// A stack-reshape op (roll/bury/reverse) costs proportional to how many
/// elements it touches.
const RESHAPE_COST_PER_ELEMENT: u64 = 2;

/// The default run-limit budget handed to a script evaluation; callers
/// may supply a smaller one to bound worst-case validation latency.
pub const DEFAULT_RUN_LIMIT: u64 = 10_000;

/// Decremented per instruction during execution; exhausting it fails the
/// script (§4.3 "Execution is bounded by a run-limit").
#[derive(Debug, Clone, Copy)]
pub struct RunLimit(u64);

impl RunLimit {
    pub fn new(budget: u64) -> Self {
        RunLimit(budget)
    }

    fn charge(&mut self, cost: u64) -> Result<()> {
        self.0 = self
            .0
            .checked_sub(cost)
            .ok_or_else(|| ChainErrorKind::validation("script exceeded its run-limit"))?;
        Ok(())
    }

    pub fn remaining(&self) -> u64 {
        self.0
    }
}

/// One element on the VM's data stack. Small integers and byte strings
/// share a single representation, the way a stack machine with untyped
/// slots naturally does; arithmetic/comparison ops interpret a slot as a
/// little-endian signed integer on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackItem(Vec<u8>);

impl StackItem {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        StackItem(bytes)
    }

    pub fn from_i64(v: i64) -> Self {
        if v == 0 {
            return StackItem(Vec::new());
        }
        StackItem(v.to_le_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Truthiness: any non-empty, non-all-zero byte string is true. This
    /// is also the verdict predicate for whole-script success.
    pub fn is_truthy(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }

    fn to_i64(&self) -> Result<i64> {
        if self.0.len() > 8 {
            return Err(ChainErrorKind::validation("integer operand wider than 8 bytes"));
        }
        let mut buf = [0u8; 8];
        buf[..self.0.len()].copy_from_slice(&self.0);
        Ok(i64::from_le_bytes(buf))
    }
}

/// The machine's state across one script evaluation: the data stack plus
/// the remaining run-limit.
pub struct Machine {
    stack: Vec<StackItem>,
    limit: RunLimit,
}

impl Machine {
    pub fn new(limit: RunLimit) -> Self {
        Machine {
            stack: Vec::new(),
            limit,
        }
    }

    fn pop(&mut self) -> Result<StackItem> {
        self.stack
            .pop()
            .ok_or_else(|| ChainErrorKind::validation("pop from an empty stack"))
    }

    fn peek(&self, depth: usize) -> Result<&StackItem> {
        let len = self.stack.len();
        if depth >= len {
            return Err(ChainErrorKind::validation("stack depth underflow"));
        }
        Ok(&self.stack[len - 1 - depth])
    }

    fn push(&mut self, item: StackItem) {
        self.stack.push(item);
    }

    pub fn stack(&self) -> &[StackItem] {
        &self.stack
    }
}

/// Executes `signature_script` followed by `control_script` against
/// `sighash` (the precomputed signing digest the spend authorizes), in
/// one continuous stack machine, and succeeds only if the final stack
/// top is truthy (§4.3). This is the verdict function `ValidateTx`
/// calls per input.
pub fn evaluate(
    signature_script: &[u8],
    control_script: &[u8],
    sighash: HashValue,
    run_limit: RunLimit,
) -> Result<()> {
    let mut machine = Machine::new(run_limit);
    run_script(&mut machine, signature_script, sighash)?;
    run_script(&mut machine, control_script, sighash)?;
    let top = machine.stack.last().ok_or_else(|| {
        ChainErrorKind::validation("script left an empty stack; no truthy verdict")
    })?;
    if !top.is_truthy() {
        return Err(ChainErrorKind::validation("script evaluated to a falsy verdict"));
    }
    Ok(())
}

fn run_script(machine: &mut Machine, script: &[u8], sighash: HashValue) -> Result<()> {
    let mut pc = 0usize;
    while pc < script.len() {
        let (op, consumed) = opcode::decode(script, pc)?;
        pc += consumed;
        execute_op(machine, &op, sighash)?;
    }
    Ok(())
}

fn execute_op(machine: &mut Machine, op: &Opcode, sighash: HashValue) -> Result<()> {
    match op {
        Opcode::Push(bytes) => {
            machine.limit.charge(BASELINE_COST + PUSH_BYTE_COST * bytes.len() as u64)?;
            machine.push(StackItem::from_bytes(bytes.clone()));
        }
        Opcode::PushSmallInt(v) => {
            machine.limit.charge(BASELINE_COST)?;
            machine.push(StackItem::from_i64(*v));
        }
        Opcode::Dup => {
            machine.limit.charge(BASELINE_COST)?;
            let top = machine.peek(0)?.clone();
            machine.push(top);
        }
        Opcode::Drop => {
            machine.limit.charge(BASELINE_COST)?;
            machine.pop()?;
        }
        Opcode::Depth => {
            machine.limit.charge(BASELINE_COST)?;
            let depth = machine.stack.len() as i64;
            machine.push(StackItem::from_i64(depth));
        }
        Opcode::Roll(n) => {
            let n = *n as usize;
            machine.limit.charge(BASELINE_COST + RESHAPE_COST_PER_ELEMENT * n as u64)?;
            if n >= machine.stack.len() {
                return Err(ChainErrorKind::validation("roll depth underflow"));
            }
            let idx = machine.stack.len() - 1 - n;
            let item = machine.stack.remove(idx);
            machine.push(item);
        }
        Opcode::Bury(n) => {
            let n = *n as usize;
            machine.limit.charge(BASELINE_COST + RESHAPE_COST_PER_ELEMENT * n as u64)?;
            let top = machine.pop()?;
            if n > machine.stack.len() {
                return Err(ChainErrorKind::validation("bury depth underflow"));
            }
            let idx = machine.stack.len() - n;
            machine.stack.insert(idx, top);
        }
        Opcode::Reverse(n) => {
            let n = *n as usize;
            machine.limit.charge(BASELINE_COST + RESHAPE_COST_PER_ELEMENT * n as u64)?;
            if n > machine.stack.len() {
                return Err(ChainErrorKind::validation("reverse width underflow"));
            }
            let len = machine.stack.len();
            machine.stack[len - n..].reverse();
        }
        Opcode::Add => binary_int_op(machine, |a, b| a.checked_add(b))?,
        Opcode::Sub => binary_int_op(machine, |a, b| a.checked_sub(b))?,
        Opcode::Mul => binary_int_op(machine, |a, b| a.checked_mul(b))?,
        Opcode::Equal => {
            machine.limit.charge(BASELINE_COST)?;
            let b = machine.pop()?;
            let a = machine.pop()?;
            machine.push(StackItem::from_i64((a == b) as i64));
        }
        Opcode::GreaterThan => {
            machine.limit.charge(BASELINE_COST)?;
            let b = machine.pop()?.to_i64()?;
            let a = machine.pop()?.to_i64()?;
            machine.push(StackItem::from_i64((a > b) as i64));
        }
        Opcode::Sha256 => {
            machine.limit.charge(BASELINE_COST * 4)?;
            let item = machine.pop()?;
            machine.push(StackItem::from_bytes(
                HashValue::sha256_of(item.as_bytes()).to_vec(),
            ));
        }
        Opcode::Sha3256 => {
            machine.limit.charge(BASELINE_COST * 4)?;
            let item = machine.pop()?;
            machine.push(StackItem::from_bytes(
                HashValue::sha3_256_of(item.as_bytes()).to_vec(),
            ));
        }
        Opcode::CheckSig => {
            machine.limit.charge(CHECKSIG_COST)?;
            let pubkey_bytes = machine.pop()?;
            let sig_bytes = machine.pop()?;
            let verdict = checksig(pubkey_bytes.as_bytes(), sig_bytes.as_bytes(), sighash);
            machine.push(StackItem::from_i64(verdict as i64));
        }
        Opcode::CheckMultisig { required, total } => {
            machine.limit.charge(CHECKSIG_COST * u64::from(*total))?;
            let total = *total as usize;
            let required = *required as usize;
            let mut pubkeys = Vec::with_capacity(total);
            for _ in 0..total {
                pubkeys.push(machine.pop()?);
            }
            pubkeys.reverse();
            let mut sig_slots = Vec::with_capacity(total);
            for _ in 0..total {
                sig_slots.push(machine.pop()?);
            }
            sig_slots.reverse();

            let public_keys: Result<Vec<PublicKey>> = pubkeys
                .iter()
                .map(|item| PublicKey::try_from(item.as_bytes()))
                .collect();
            let public_keys = match public_keys {
                Ok(keys) => keys,
                Err(_) => {
                    machine.push(StackItem::from_i64(0));
                    return Ok(());
                }
            };
            let signatures: Vec<Option<Signature>> = sig_slots
                .iter()
                .map(|item| {
                    if item.as_bytes().is_empty() {
                        None
                    } else {
                        Signature::try_from(item.as_bytes()).ok()
                    }
                })
                .collect();
            let verdict = verify_multisig(sighash.as_bytes(), &public_keys, &signatures, required);
            machine.push(StackItem::from_i64(verdict as i64));
        }
        Opcode::PayToContract { contract_hash } => {
            machine.limit.charge(CHECKSIG_COST)?;
            let params = machine.pop()?;
            let clause = machine.pop()?;
            let mut preimage = Vec::new();
            preimage.extend_from_slice(clause.as_bytes());
            preimage.extend_from_slice(params.as_bytes());
            let commitment = HashValue::sha3_256_of(&preimage);
            machine.push(StackItem::from_i64((commitment == *contract_hash) as i64));
        }
        Opcode::Reserved(code) => {
            debug!("script hit a version-reserved opcode"; "opcode" => code);
            return Err(ChainErrorKind::validation(format!(
                "opcode 0x{:02x} is reserved for a future chain version",
                code
            )));
        }
    }
    Ok(())
}

fn binary_int_op(machine: &mut Machine, f: impl Fn(i64, i64) -> Option<i64>) -> Result<()> {
    machine.limit.charge(BASELINE_COST)?;
    let b = machine.pop()?.to_i64()?;
    let a = machine.pop()?.to_i64()?;
    let result = f(a, b).ok_or_else(|| ChainErrorKind::validation("arithmetic overflow in script"))?;
    machine.push(StackItem::from_i64(result));
    Ok(())
}

fn checksig(pubkey_bytes: &[u8], sig_bytes: &[u8], sighash: HashValue) -> bool {
    let (Ok(pubkey), Ok(sig)) = (PublicKey::try_from(pubkey_bytes), Signature::try_from(sig_bytes)) else {
        return false;
    };
    pubkey.verify(sighash.as_bytes(), &sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_crypto::PrivateKey;
    use opcode::ScriptBuilder;

    fn limit() -> RunLimit {
        RunLimit::new(DEFAULT_RUN_LIMIT)
    }

    #[test]
    fn trivial_true_script_passes() {
        let control = ScriptBuilder::new().push_small_int(1).into_bytes();
        assert!(evaluate(&[], &control, HashValue::zero(), limit()).is_ok());
    }

    #[test]
    fn empty_stack_at_end_fails() {
        let control = ScriptBuilder::new()
            .push_small_int(1)
            .op(Opcode::Drop)
            .into_bytes();
        assert!(evaluate(&[], &control, HashValue::zero(), limit()).is_err());
    }

    #[test]
    fn checksig_opcode_verifies_a_real_signature() {
        let key = PrivateKey::generate();
        let sighash = HashValue::sha3_256_of(b"tx to sign");
        let sig = key.sign(sighash.as_bytes());

        let signature_script = ScriptBuilder::new().push(sig.to_bytes().to_vec()).into_bytes();
        let control_script = ScriptBuilder::new()
            .push(key.public_key().to_bytes().to_vec())
            .op(Opcode::CheckSig)
            .into_bytes();

        assert!(evaluate(&signature_script, &control_script, sighash, limit()).is_ok());
    }

    #[test]
    fn checksig_rejects_signature_over_wrong_message() {
        let key = PrivateKey::generate();
        let sighash = HashValue::sha3_256_of(b"tx to sign");
        let wrong_sig = key.sign(HashValue::sha3_256_of(b"different message").as_bytes());

        let signature_script = ScriptBuilder::new().push(wrong_sig.to_bytes().to_vec()).into_bytes();
        let control_script = ScriptBuilder::new()
            .push(key.public_key().to_bytes().to_vec())
            .op(Opcode::CheckSig)
            .into_bytes();

        assert!(evaluate(&signature_script, &control_script, sighash, limit()).is_err());
    }

    #[test]
    fn multisig_requires_threshold_valid_signatures() {
        let keys: Vec<PrivateKey> = (0..3).map(|_| PrivateKey::generate()).collect();
        let sighash = HashValue::sha3_256_of(b"multisig tx");
        let sig0 = keys[0].sign(sighash.as_bytes());
        let sig2 = keys[2].sign(sighash.as_bytes());

        let mut sig_script = ScriptBuilder::new();
        sig_script.push(sig0.to_bytes().to_vec());
        sig_script.push(vec![]); // no signature from keys[1]
        sig_script.push(sig2.to_bytes().to_vec());
        let signature_script = sig_script.into_bytes();

        let mut control = ScriptBuilder::new();
        for key in &keys {
            control.push(key.public_key().to_bytes().to_vec());
        }
        control.op(Opcode::CheckMultisig { required: 2, total: 3 });
        let control_script = control.into_bytes();

        assert!(evaluate(&signature_script, &control_script, sighash, limit()).is_ok());
    }

    #[test]
    fn multisig_fails_below_threshold() {
        let keys: Vec<PrivateKey> = (0..3).map(|_| PrivateKey::generate()).collect();
        let sighash = HashValue::sha3_256_of(b"multisig tx");
        let sig0 = keys[0].sign(sighash.as_bytes());

        let mut sig_script = ScriptBuilder::new();
        sig_script.push(sig0.to_bytes().to_vec());
        sig_script.push(vec![]);
        sig_script.push(vec![]);
        let signature_script = sig_script.into_bytes();

        let mut control = ScriptBuilder::new();
        for key in &keys {
            control.push(key.public_key().to_bytes().to_vec());
        }
        control.op(Opcode::CheckMultisig { required: 2, total: 3 });
        let control_script = control.into_bytes();

        assert!(evaluate(&signature_script, &control_script, sighash, limit()).is_err());
    }

    #[test]
    fn pay_to_contract_accepts_matching_clause_and_params() {
        let clause = b"orderbook-fill".to_vec();
        let params = b"price=100".to_vec();
        let mut preimage = clause.clone();
        preimage.extend_from_slice(&params);
        let contract_hash = HashValue::sha3_256_of(&preimage);

        let signature_script = ScriptBuilder::new().push(clause).push(params).into_bytes();
        let control_script = ScriptBuilder::new()
            .op(Opcode::PayToContract { contract_hash })
            .into_bytes();

        assert!(evaluate(&signature_script, &control_script, HashValue::zero(), limit()).is_ok());
    }

    #[test]
    fn overflowing_arithmetic_fails_the_script() {
        let control = ScriptBuilder::new()
            .push_small_int(i64::MAX)
            .push_small_int(1)
            .op(Opcode::Add)
            .into_bytes();
        assert!(evaluate(&[], &control, HashValue::zero(), limit()).is_err());
    }

    #[test]
    fn run_limit_is_exhausted_by_oversized_data_push() {
        let control = ScriptBuilder::new().push(vec![0u8; 64]).into_bytes();
        assert!(evaluate(&[], &control, HashValue::zero(), RunLimit::new(10)).is_err());
    }

    #[test]
    fn reserved_opcode_always_fails_on_current_version() {
        let control = vec![opcode::RESERVED_BASE];
        assert!(evaluate(&[], &control, HashValue::zero(), limit()).is_err());
    }

    #[test]
    fn roll_brings_a_deep_element_to_the_top() {
        let control = ScriptBuilder::new()
            .push_small_int(1)
            .push_small_int(2)
            .push_small_int(3)
            .op(Opcode::Roll(2))
            .op(Opcode::Drop) // drop the rolled 1
            .op(Opcode::Drop) // drop 3
            .into_bytes();
        // stack should now hold just [2], which is truthy
        assert!(evaluate(&[], &control, HashValue::zero(), limit()).is_ok());
    }
}
