use coins_bip32::path::DerivationPath;
use serde_json::{Map, Value};

use crate::flow::context::{FlowContext, Step, actions, errors, keys, out};

/// Sign a 32-byte transaction hash with the key at a BIP44 path.
pub(crate) fn run(ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;
    ctx.open_secure_channel_and_authenticate(true)?;
    ctx.require_keys()?;

    let (hash, path) = loop {
        if ctx.cancelled() {
            return Err(crate::flow::context::FlowInterrupt::Cancelled);
        }
        let hash = ctx.param_str(keys::TX_HASH);
        let path = ctx.param_str(keys::BIP44_PATH);
        match (hash, path) {
            (Some(hash), Some(path)) => break (hash, path),
            _ => ctx.pause_and_wait(actions::ENTER_PATH, errors::MISSING_CREDENTIALS)?,
        }
    };

    let hash: [u8; 32] = hex::decode(hash.trim_start_matches("0x"))
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| ctx.fail_tag(errors::MISSING_CREDENTIALS))?;
    let path: DerivationPath = path
        .parse()
        .map_err(|_| ctx.fail_tag(errors::MISSING_CREDENTIALS))?;

    let signature = ctx
        .with_card(|card| card.sign(&hash, Some(&path)))
        .map_err(|e| ctx.fail(errors::CARD_ERROR, e))?;

    let mut result = ctx.result_base();
    result.insert(
        out::TX_SIGNATURE.to_string(),
        Value::String(signature.to_hex()),
    );
    Ok(result)
}
