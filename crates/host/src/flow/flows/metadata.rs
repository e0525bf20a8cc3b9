use serde_json::{Map, Value};

use crate::constants::{data, paths};
use crate::flow::context::{FlowContext, FlowInterrupt, Step, actions, errors, keys, out};
use crate::types::Metadata;

/// Read the metadata blob from the public slot. Works without
/// authentication: the slot is world-readable.
pub(crate) fn get(ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;

    let blob = ctx
        .with_card(|card| card.get_data(data::SLOT_PUBLIC))
        .map_err(|e| ctx.fail(errors::CARD_ERROR, e))?;

    let metadata = if blob.is_empty() {
        Value::Null
    } else {
        Metadata::decode(&blob)
            .map_err(|e| ctx.fail(errors::CARD_ERROR, e))?
            .to_json()
    };

    let mut result = ctx.result_base();
    result.insert(out::CARD_METADATA.to_string(), metadata);
    Ok(result)
}

/// Write the metadata blob. Requires authentication; pauses for the card
/// name when absent.
pub(crate) fn store(ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;
    ctx.open_secure_channel_and_authenticate(true)?;

    let name = loop {
        if ctx.cancelled() {
            return Err(FlowInterrupt::Cancelled);
        }
        match ctx.param_str(keys::CARD_NAME) {
            Some(name) => break name,
            None => ctx.pause_and_wait(actions::ENTER_NAME, errors::MISSING_CREDENTIALS)?,
        }
    };

    let wallets = parse_wallets(ctx)?;
    let metadata =
        Metadata::new(name, wallets).map_err(|e| ctx.fail(errors::MISSING_CREDENTIALS, e))?;

    ctx.with_card(|card| card.store_data(data::SLOT_PUBLIC, &metadata.encode()))
        .map_err(|e| ctx.fail(errors::CARD_ERROR, e))?;

    let mut result = ctx.result_base();
    result.insert(out::CARD_METADATA.to_string(), metadata.to_json());
    Ok(result)
}

// Accept wallet indices as numbers or as full BIP44 paths, which must sit
// under the wallet root.
fn parse_wallets(ctx: &FlowContext<'_>) -> Step<Vec<u32>> {
    let Some(paths_value) = ctx.params.get(keys::PATHS) else {
        return Ok(Vec::new());
    };
    let Value::Array(entries) = paths_value else {
        return Err(ctx.fail_tag(errors::MISSING_CREDENTIALS));
    };

    let mut wallets = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::Number(n) => {
                let index = n
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| ctx.fail_tag(errors::MISSING_CREDENTIALS))?;
                wallets.push(index);
            }
            Value::String(path) => {
                let prefix = format!("{}/", paths::WALLET_ROOT);
                let index = path
                    .strip_prefix(&prefix)
                    .and_then(|last| last.parse::<u32>().ok())
                    .ok_or_else(|| ctx.fail_tag(errors::MISSING_CREDENTIALS))?;
                wallets.push(index);
            }
            _ => return Err(ctx.fail_tag(errors::MISSING_CREDENTIALS)),
        }
    }
    Ok(wallets)
}
