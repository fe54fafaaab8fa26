//! Decoding of NEO virtual machine invocation scripts.
//!
//! Only the push-data subset of the instruction set is interpreted. That is
//! enough to recover the arguments handed to a contract deployment syscall
//! and to NEP5 `transfer` application calls, which is all the downstream
//! pipelines need. Anything else in the script is skipped.

mod hash;

use bigdecimal::{BigDecimal, Zero};
use thiserror::Error;

pub use hash::{hash160, script_hash_hex, script_hash_to_address};

use crate::models::{ContractRegistration, Nep5Transfer};

const PUSH0: u8 = 0x00;
const PUSHBYTES75: u8 = 0x4b;
const PUSHDATA1: u8 = 0x4c;
const PUSHDATA2: u8 = 0x4d;
const PUSHDATA4: u8 = 0x4e;
const PUSHM1: u8 = 0x4f;
const PUSH1: u8 = 0x51;
const PUSH16: u8 = 0x60;
const JMP: u8 = 0x62;
const CALL: u8 = 0x65;
const APPCALL: u8 = 0x67;
const SYSCALL: u8 = 0x68;
const TAILCALL: u8 = 0x69;
const PACK: u8 = 0xc1;

const REGISTRATION_ARGS: usize = 9;
const TRANSFER_METHOD: &[u8] = b"transfer";
const DEPLOY_SYSCALLS: [&str; 4] = [
    "Neo.Contract.Create",
    "Neo.Contract.Migrate",
    "AntShares.Contract.Create",
    "AntShares.Contract.Migrate",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    /// The script ended in the middle of an instruction operand.
    #[error("script truncated at offset {0}")]
    Truncated(usize),

    /// An instruction needed more stack items than were pushed.
    #[error("stack underflow at offset {0}")]
    StackUnderflow(usize),

    /// `PACK` was given a count that is not a small non-negative integer.
    #[error("invalid pack count at offset {0}")]
    InvalidPack(usize),
}

/// Extracts indexer-relevant calls from an invocation script.
pub trait ScriptDecoder: Send + Sync {
    /// Returns the contract deployed by the script, if it contains a deployment syscall.
    fn registration(&self, script: &[u8]) -> Result<Option<ContractRegistration>, ScriptError>;

    /// Returns every NEP5 `transfer` call made by the script, in script order.
    fn transfers(&self, script: &[u8]) -> Result<Vec<Nep5Transfer>, ScriptError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    Bytes(Vec<u8>),
    Array(Vec<Item>),
}

impl Item {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Item::Bytes(bytes) => bytes,
            Item::Array(_) => Vec::new(),
        }
    }
}

enum Event {
    Syscall { name: String, offset: usize },
    AppCall { hash: [u8; 20] },
}

/// Push-data interpreter for AVM scripts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AvmDecoder;

impl AvmDecoder {
    /// Walks the script, handing each syscall and application call to `on_event`
    /// together with the evaluation stack as it stood at that point.
    fn walk<F>(script: &[u8], mut on_event: F) -> Result<(), ScriptError>
    where
        F: FnMut(Event, &mut Vec<Item>) -> Result<bool, ScriptError>,
    {
        let mut stack: Vec<Item> = Vec::new();
        let mut pc = 0usize;

        while pc < script.len() {
            let offset = pc;
            let op = script[pc];
            pc += 1;

            match op {
                PUSH0 => stack.push(Item::Bytes(Vec::new())),
                0x01..=PUSHBYTES75 => {
                    let data = take(script, &mut pc, op as usize, offset)?;
                    stack.push(Item::Bytes(data.to_vec()));
                },
                PUSHDATA1 | PUSHDATA2 | PUSHDATA4 => {
                    let width = match op {
                        PUSHDATA1 => 1,
                        PUSHDATA2 => 2,
                        _ => 4,
                    };
                    let len_bytes = take(script, &mut pc, width, offset)?;
                    let len = len_bytes
                        .iter()
                        .rev()
                        .fold(0usize, |acc, b| (acc << 8) | *b as usize);
                    let data = take(script, &mut pc, len, offset)?;
                    stack.push(Item::Bytes(data.to_vec()));
                },
                PUSHM1 => stack.push(Item::Bytes(vec![0xff])),
                PUSH1..=PUSH16 => stack.push(Item::Bytes(vec![op - PUSH1 + 1])),
                JMP..=CALL => {
                    take(script, &mut pc, 2, offset)?;
                },
                PACK => {
                    let count = stack.pop().ok_or(ScriptError::StackUnderflow(offset))?;
                    let count = small_integer(&count.into_bytes()).ok_or(ScriptError::InvalidPack(offset))?;
                    if stack.len() < count {
                        return Err(ScriptError::StackUnderflow(offset));
                    }
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        if let Some(item) = stack.pop() {
                            items.push(item);
                        }
                    }
                    stack.push(Item::Array(items));
                },
                APPCALL | TAILCALL => {
                    let operand = take(script, &mut pc, 20, offset)?;
                    let mut hash = [0u8; 20];
                    hash.copy_from_slice(operand);
                    if !on_event(Event::AppCall { hash }, &mut stack)? {
                        return Ok(());
                    }
                },
                SYSCALL => {
                    let len = take(script, &mut pc, 1, offset)?[0] as usize;
                    let name = take(script, &mut pc, len, offset)?;
                    let name = String::from_utf8_lossy(name).into_owned();
                    if !on_event(Event::Syscall { name, offset }, &mut stack)? {
                        return Ok(());
                    }
                },
                _ => {},
            }
        }
        Ok(())
    }
}

impl ScriptDecoder for AvmDecoder {
    fn registration(&self, script: &[u8]) -> Result<Option<ContractRegistration>, ScriptError> {
        let mut found = None;
        Self::walk(script, |event, stack| {
            let Event::Syscall { name, offset } = event else {
                return Ok(true);
            };
            if !DEPLOY_SYSCALLS.contains(&name.as_str()) {
                return Ok(true);
            }
            if stack.len() < REGISTRATION_ARGS {
                return Err(ScriptError::StackUnderflow(offset));
            }
            stack.truncate(REGISTRATION_ARGS);

            let mut next = || stack.pop().map(Item::into_bytes).unwrap_or_default();
            let code = next();
            let parameter_list = hex::encode(next());
            let return_type = hex::encode(next());
            let need_storage = next().first().is_some_and(|flags| flags & 0x01 != 0);
            let mut text = || String::from_utf8_lossy(&next()).into_owned();
            let name = text();
            let version = text();
            let author = text();
            let email = text();
            let description = text();

            found = Some(ContractRegistration {
                script_hash: script_hash_hex(&hash160(&code)),
                parameter_list,
                return_type,
                need_storage,
                name,
                version,
                author,
                email,
                description,
            });
            Ok(false)
        })?;
        Ok(found)
    }

    fn transfers(&self, script: &[u8]) -> Result<Vec<Nep5Transfer>, ScriptError> {
        let mut transfers = Vec::new();
        Self::walk(script, |event, stack| {
            let Event::AppCall { hash } = event else {
                return Ok(true);
            };
            let method = stack.pop();
            let args = stack.pop();
            if hash == [0u8; 20] {
                return Ok(true);
            }
            if let (Some(Item::Bytes(method)), Some(Item::Array(args))) = (method, args) {
                if method == TRANSFER_METHOD {
                    if let Some(transfer) = transfer_from_args(&hash, args) {
                        transfers.push(transfer);
                    }
                }
            }
            Ok(true)
        })?;
        Ok(transfers)
    }
}

fn transfer_from_args(contract: &[u8; 20], args: Vec<Item>) -> Option<Nep5Transfer> {
    let [from, to, amount]: [Item; 3] = args.try_into().ok()?;
    let (Item::Bytes(from), Item::Bytes(to), Item::Bytes(amount)) = (from, to, amount) else {
        return None;
    };
    if to.len() != 20 || !(from.is_empty() || from.len() == 20) {
        return None;
    }
    Some(Nep5Transfer {
        contract: script_hash_hex(contract),
        from: (!from.is_empty()).then(|| script_hash_to_address(&from)),
        to: script_hash_to_address(&to),
        amount: le_integer(&amount),
    })
}

fn take<'a>(script: &'a [u8], pc: &mut usize, len: usize, offset: usize) -> Result<&'a [u8], ScriptError> {
    let end = pc.checked_add(len).ok_or(ScriptError::Truncated(offset))?;
    let data = script.get(*pc..end).ok_or(ScriptError::Truncated(offset))?;
    *pc = end;
    Ok(data)
}

fn small_integer(bytes: &[u8]) -> Option<usize> {
    match bytes {
        [] => Some(0),
        [n] if *n < 0x80 => Some(*n as usize),
        _ => None,
    }
}

/// VM integers are little-endian two's complement of arbitrary width.
fn le_integer(bytes: &[u8]) -> BigDecimal {
    let radix = BigDecimal::from(256u32);
    let mut value = BigDecimal::zero();
    let mut weight = BigDecimal::from(1u32);
    for byte in bytes {
        value += BigDecimal::from(*byte as u32) * &weight;
        weight = weight * &radix;
    }
    if bytes.last().is_some_and(|b| b & 0x80 != 0) {
        value -= weight;
    }
    value
}

#[cfg(test)]
pub(crate) mod builder {
    //! Tiny assembler for building test scripts.

    use super::*;

    #[derive(Default)]
    pub struct ScriptBuilder(Vec<u8>);

    impl ScriptBuilder {
        pub fn push(mut self, data: &[u8]) -> Self {
            match data.len() {
                0 => self.0.push(PUSH0),
                len if len <= PUSHBYTES75 as usize => {
                    self.0.push(len as u8);
                    self.0.extend_from_slice(data);
                },
                len if len <= 0xff => {
                    self.0.push(PUSHDATA1);
                    self.0.push(len as u8);
                    self.0.extend_from_slice(data);
                },
                len => {
                    self.0.push(PUSHDATA2);
                    self.0.extend_from_slice(&(len as u16).to_le_bytes());
                    self.0.extend_from_slice(data);
                },
            }
            self
        }

        pub fn push_int(mut self, n: u8) -> Self {
            match n {
                0 => self.0.push(PUSH0),
                1..=16 => self.0.push(PUSH1 + n - 1),
                _ => return self.push(&[n]),
            }
            self
        }

        pub fn pack(mut self) -> Self {
            self.0.push(PACK);
            self
        }

        pub fn syscall(mut self, name: &str) -> Self {
            self.0.push(SYSCALL);
            self.0.push(name.len() as u8);
            self.0.extend_from_slice(name.as_bytes());
            self
        }

        pub fn appcall(mut self, hash: &[u8; 20]) -> Self {
            self.0.push(APPCALL);
            self.0.extend_from_slice(hash);
            self
        }

        pub fn raw(mut self, op: u8) -> Self {
            self.0.push(op);
            self
        }

        pub fn build(self) -> Vec<u8> {
            self.0
        }
    }

    pub fn transfer_script(contract: &[u8; 20], from: &[u8], to: &[u8; 20], amount: &[u8]) -> Vec<u8> {
        ScriptBuilder::default()
            .push(amount)
            .push(to)
            .push(from)
            .push_int(3)
            .pack()
            .push(TRANSFER_METHOD)
            .appcall(contract)
            .raw(0xf1)
            .build()
    }

    pub fn deploy_script(code: &[u8], name: &str) -> Vec<u8> {
        ScriptBuilder::default()
            .push(b"a token")
            .push(b"dev@example.org")
            .push(b"someone")
            .push(b"1.0")
            .push(name.as_bytes())
            .push_int(1)
            .push(&[0x05])
            .push(&[0x07, 0x10])
            .push(code)
            .syscall("Neo.Contract.Create")
            .build()
    }
}
