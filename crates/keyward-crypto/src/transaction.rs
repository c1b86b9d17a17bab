//! Ethereum transaction parsing, RLP encoding and signing.
//!
//! Two envelopes are supported:
//!
//! - **Legacy** with EIP-155 replay protection
//!   (`v = recovery_id + chain_id * 2 + 35`).
//! - **EIP-1559** (type `0x02`) with an empty access list.
//!
//! The type is chosen from the fee fields: `maxFeePerGas` selects
//! EIP-1559, `gasPrice` selects legacy. Fee estimation and nonce
//! lookup belong to the chain RPC layer, so missing values are
//! rejected as `invalid_request` rather than guessed.

use alloy_rlp::{BufMut, Encodable, Header};
use keyward_types::{Address, KeywardError, Result, ValidationCode};
use serde::Serialize;
use serde_json::Value;

use crate::signing::{keccak256, EthKey};

/// EIP-2718 type byte for dynamic-fee transactions.
const EIP1559_TX_TYPE: u8 = 0x02;

// ---------------------------------------------------------------------------
// TransactionRequest
// ---------------------------------------------------------------------------

/// Fee model of a transaction request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FeeModel {
    /// Single `gasPrice` (legacy, EIP-155).
    Legacy {
        /// Price per gas in wei.
        gas_price: u128,
    },
    /// `maxFeePerGas` + `maxPriorityFeePerGas` (EIP-1559).
    Dynamic {
        /// Fee cap per gas in wei.
        max_fee_per_gas: u128,
        /// Tip cap per gas in wei.
        max_priority_fee_per_gas: u128,
    },
}

/// A parsed, fully specified transaction ready for signing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionRequest {
    /// Declared sender, if any. Must match the signing account.
    pub from: Option<Address>,
    /// Recipient; `None` for contract creation.
    pub to: Option<Address>,
    /// Value in wei.
    pub value: u128,
    /// Call data.
    pub data: Vec<u8>,
    /// Sender nonce.
    pub nonce: u64,
    /// Gas limit.
    pub gas_limit: u64,
    /// Fee fields.
    pub fee: FeeModel,
    /// EIP-155 chain id.
    pub chain_id: u64,
}

impl TransactionRequest {
    /// Parses a JSON transaction object.
    ///
    /// Accepted fields: `from`, `to`, `value`, `data` (or `input`),
    /// `nonce`, `gas` (or `gasLimit`), `gasPrice`, `maxFeePerGas`,
    /// `maxPriorityFeePerGas`, `chainId`. Quantities may be JSON
    /// numbers, `0x` hex strings, or decimal strings.
    ///
    /// # Errors
    ///
    /// Returns a `invalid_request` validation error naming the first
    /// missing or malformed field.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| invalid("transaction must be a JSON object"))?;

        let from = optional_address(obj.get("from"), "from")?;
        let to = optional_address(obj.get("to"), "to")?;
        let value_wei = match obj.get("value") {
            Some(v) if !v.is_null() => parse_quantity(v, "value")?,
            _ => 0,
        };
        let data = match obj.get("data").or_else(|| obj.get("input")) {
            Some(Value::String(s)) => decode_hex_data(s)?,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(invalid("data must be a hex string")),
        };
        let nonce = required_u64(obj.get("nonce"), "nonce")?;
        let gas_limit = required_u64(obj.get("gas").or_else(|| obj.get("gasLimit")), "gas")?;
        let chain_id = required_u64(obj.get("chainId"), "chainId")?;

        let max_fee = obj.get("maxFeePerGas").filter(|v| !v.is_null());
        let max_priority = obj.get("maxPriorityFeePerGas").filter(|v| !v.is_null());
        let gas_price = obj.get("gasPrice").filter(|v| !v.is_null());

        let fee = match (max_fee, max_priority, gas_price) {
            (Some(fee), Some(tip), _) => FeeModel::Dynamic {
                max_fee_per_gas: parse_quantity(fee, "maxFeePerGas")?,
                max_priority_fee_per_gas: parse_quantity(tip, "maxPriorityFeePerGas")?,
            },
            (Some(_), None, _) | (None, Some(_), _) => {
                return Err(invalid(
                    "maxFeePerGas and maxPriorityFeePerGas must be supplied together",
                ))
            }
            (None, None, Some(price)) => FeeModel::Legacy {
                gas_price: parse_quantity(price, "gasPrice")?,
            },
            (None, None, None) => {
                return Err(invalid("missing fee fields: gasPrice or maxFeePerGas"))
            }
        };

        if chain_id == 0 || chain_id > (u64::MAX - 36) / 2 {
            return Err(invalid("chainId out of range"));
        }

        Ok(Self {
            from,
            to,
            value: value_wei,
            data,
            nonce,
            gas_limit,
            fee,
            chain_id,
        })
    }

    /// Returns the digest that gets signed.
    pub fn signing_hash(&self) -> [u8; 32] {
        keccak256(&self.signing_payload())
    }

    fn signing_payload(&self) -> Vec<u8> {
        let to = self.to_bytes();
        match self.fee {
            FeeModel::Legacy { gas_price } => rlp_list(&[
                &self.nonce,
                &gas_price,
                &self.gas_limit,
                &to.as_slice(),
                &self.value,
                &self.data.as_slice(),
                &self.chain_id,
                &0u8,
                &0u8,
            ]),
            FeeModel::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut out = vec![EIP1559_TX_TYPE];
                out.extend(rlp_list(&[
                    &self.chain_id,
                    &self.nonce,
                    &max_priority_fee_per_gas,
                    &max_fee_per_gas,
                    &self.gas_limit,
                    &to.as_slice(),
                    &self.value,
                    &self.data.as_slice(),
                    &EmptyList,
                ]));
                out
            }
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.to.map(|a| a.as_bytes().to_vec()).unwrap_or_default()
    }

    /// Signs the transaction with `key`.
    ///
    /// # Errors
    ///
    /// - `invalid_request` if `from` is set and differs from the key's
    ///   address.
    /// - [`KeywardError::CryptoError`] if signing fails.
    pub fn sign(&self, key: &EthKey) -> Result<SignedTransaction> {
        if let Some(from) = self.from {
            if from != key.address() {
                return Err(invalid("transaction 'from' does not match the signing account"));
            }
        }

        let sig = key.sign_prehash(&self.signing_hash())?;
        let r = strip_leading_zeros(&sig.r);
        let s = strip_leading_zeros(&sig.s);
        let to = self.to_bytes();

        let (raw, v) = match self.fee {
            FeeModel::Legacy { gas_price } => {
                let v = u64::from(sig.recovery_id) + self.chain_id * 2 + 35;
                let raw = rlp_list(&[
                    &self.nonce,
                    &gas_price,
                    &self.gas_limit,
                    &to.as_slice(),
                    &self.value,
                    &self.data.as_slice(),
                    &v,
                    &r.as_slice(),
                    &s.as_slice(),
                ]);
                (raw, v)
            }
            FeeModel::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let y_parity = u64::from(sig.recovery_id);
                let mut raw = vec![EIP1559_TX_TYPE];
                raw.extend(rlp_list(&[
                    &self.chain_id,
                    &self.nonce,
                    &max_priority_fee_per_gas,
                    &max_fee_per_gas,
                    &self.gas_limit,
                    &to.as_slice(),
                    &self.value,
                    &self.data.as_slice(),
                    &EmptyList,
                    &y_parity,
                    &r.as_slice(),
                    &s.as_slice(),
                ]));
                (raw, y_parity)
            }
        };

        Ok(SignedTransaction {
            hash: format!("0x{}", hex::encode(keccak256(&raw))),
            raw_transaction: format!("0x{}", hex::encode(&raw)),
            v,
            r: sig.r,
            s: sig.s,
        })
    }
}

// ---------------------------------------------------------------------------
// SignedTransaction
// ---------------------------------------------------------------------------

/// A signed, broadcast-ready transaction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    /// `0x`-prefixed raw transaction bytes.
    pub raw_transaction: String,
    /// `0x`-prefixed transaction hash.
    pub hash: String,
    /// Encoded `v` (EIP-155 value for legacy, y-parity for EIP-1559).
    #[serde(skip)]
    pub v: u64,
    /// Signature `r`.
    #[serde(skip)]
    pub r: [u8; 32],
    /// Signature `s`.
    #[serde(skip)]
    pub s: [u8; 32],
}

// ---------------------------------------------------------------------------
// RLP helpers
// ---------------------------------------------------------------------------

/// An empty RLP list (the access list we never populate).
struct EmptyList;

impl Encodable for EmptyList {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: 0,
        }
        .encode(out);
    }

    fn length(&self) -> usize {
        1
    }
}

fn rlp_list(fields: &[&dyn Encodable]) -> Vec<u8> {
    let payload_length = fields.iter().map(|f| f.length()).sum();
    let mut out = Vec::new();
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    for field in fields {
        field.encode(&mut out);
    }
    out
}

fn strip_leading_zeros(bytes: &[u8; 32]) -> Vec<u8> {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

fn invalid(message: &str) -> KeywardError {
    KeywardError::validation(ValidationCode::InvalidRequest, message)
}

fn parse_quantity(value: &Value, field: &str) -> Result<u128> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(u128::from)
            .ok_or_else(|| invalid(&format!("{field} must be a non-negative integer"))),
        Value::String(s) => {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some("") => Ok(0),
                Some(hex_body) => u128::from_str_radix(hex_body, 16),
                None => s.parse::<u128>(),
            };
            parsed.map_err(|_| invalid(&format!("{field} is not a valid quantity")))
        }
        _ => Err(invalid(&format!("{field} must be a number or string"))),
    }
}

fn required_u64(value: Option<&Value>, field: &str) -> Result<u64> {
    let value = value
        .filter(|v| !v.is_null())
        .ok_or_else(|| invalid(&format!("missing field: {field}")))?;
    let q = parse_quantity(value, field)?;
    u64::try_from(q).map_err(|_| invalid(&format!("{field} exceeds 64 bits")))
}

fn optional_address(value: Option<&Value>, field: &str) -> Result<Option<Address>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| invalid(&format!("{field} is not a valid address"))),
        Some(_) => Err(invalid(&format!("{field} must be a string"))),
    }
}

fn decode_hex_data(s: &str) -> Result<Vec<u8>> {
    let body = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(body).map_err(|_| invalid("data is not valid hex"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
