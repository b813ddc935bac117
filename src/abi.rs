//! Bindings for the prompt inference contract and the decoder for its
//! `output` field.

use crate::model::{InferenceRecord, ModelSelector, RequestId};
use alloy_primitives::U256;
use alloy_sol_types::{SolCall, SolType, sol, sol_data};

sol! {
    /// The on-chain half of the Homy oracle.
    interface IPromptNestedInference {
        function calculateAIResult(uint256 model1Id, uint256 model2Id, string prompt) external payable returns (uint256);
        function requests(uint256 requestId) external view returns (address sender, uint256 modelId, bytes input, bytes output);
    }
}

pub use IPromptNestedInference::{calculateAIResultCall, requestsCall};

const WORD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("output is not valid hex: {0}")]
    Hex(String),
    #[error("output is not an ABI encoded string: {0}")]
    Abi(String),
    #[error("output is not valid UTF-8: {0}")]
    Utf8(String),
}

pub fn encode_submit(selector: ModelSelector, prompt: &str) -> Vec<u8> {
    calculateAIResultCall {
        model1Id: U256::from(selector.first),
        model2Id: U256::from(selector.second),
        prompt: prompt.to_string(),
    }
    .abi_encode()
}

pub fn encode_read(request_id: RequestId) -> Vec<u8> {
    requestsCall {
        requestId: request_id.as_u256(),
    }
    .abi_encode()
}

pub fn decode_read(data: &[u8]) -> Result<InferenceRecord, DecodeError> {
    let ret = requestsCall::abi_decode_returns(data)
        .map_err(|error| DecodeError::Abi(error.to_string()))?;
    Ok(InferenceRecord {
        sender: ret.sender,
        model_id: ret.modelId,
        input: ret.input,
        output: ret.output,
    })
}

/// Decodes a resolved `output` value into text.
///
/// `output` holds a single ABI `string` parameter. The payload is read as
/// raw bytes and must be valid UTF-8; nothing is replaced lossily.
pub fn decode_output(output: &[u8]) -> Result<String, DecodeError> {
    let (payload,) = <(sol_data::Bytes,) as SolType>::abi_decode_params(output)
        .map_err(|error| DecodeError::Abi(error.to_string()))?;
    String::from_utf8(payload.to_vec()).map_err(|error| DecodeError::Utf8(error.to_string()))
}

/// Word-level decoder for a hex `output` value.
///
/// Reads the offset word, then the length word, then the payload and
/// interprets it as UTF-8. Must agree with [`decode_output`].
pub fn decode_output_hex(output_hex: &str) -> Result<String, DecodeError> {
    let trimmed = output_hex.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let raw = hex::decode(digits).map_err(|error| DecodeError::Hex(error.to_string()))?;

    let offset = read_word_as_usize(&raw, 0)?;
    let length = read_word_as_usize(&raw, offset)?;
    let start = offset
        .checked_add(WORD)
        .ok_or_else(|| DecodeError::Abi("offset overflows".to_string()))?;
    let end = start
        .checked_add(length)
        .ok_or_else(|| DecodeError::Abi("length overflows".to_string()))?;
    let payload = raw.get(start..end).ok_or_else(|| {
        DecodeError::Abi(format!(
            "payload [{start}..{end}) exceeds {} bytes",
            raw.len()
        ))
    })?;

    String::from_utf8(payload.to_vec()).map_err(|error| DecodeError::Utf8(error.to_string()))
}

/// Encodes text the way the contract writes a resolved `output`.
pub fn encode_output(text: &str) -> Vec<u8> {
    <(sol_data::String,) as SolType>::abi_encode_params(&(text.to_string(),))
}

fn read_word_as_usize(raw: &[u8], at: usize) -> Result<usize, DecodeError> {
    let word = at
        .checked_add(WORD)
        .and_then(|end| raw.get(at..end))
        .ok_or_else(|| DecodeError::Abi(format!("missing 32-byte word at {at}")))?;
    let value = U256::from_be_slice(word);
    usize::try_from(value).map_err(|_| DecodeError::Abi(format!("word at {at} is too large")))
}
