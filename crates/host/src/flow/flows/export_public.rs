use coins_bip32::path::DerivationPath;
use serde_json::{Map, Value};

use crate::command_set::ExportOption;
use crate::flow::context::{FlowContext, FlowInterrupt, Step, actions, errors, keys, out};

/// Export public keys. The `path` parameter is either one path string or
/// an array of them; the result shape matches the input shape.
pub(crate) fn run(ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;
    ctx.open_secure_channel_and_authenticate(true)?;
    ctx.require_keys()?;

    let requested = loop {
        if ctx.cancelled() {
            return Err(FlowInterrupt::Cancelled);
        }
        match ctx.params.get(keys::PATH).cloned() {
            Some(value @ (Value::String(_) | Value::Array(_))) => break value,
            _ => ctx.pause_and_wait(actions::ENTER_PATH, errors::MISSING_CREDENTIALS)?,
        }
    };

    let exported = match &requested {
        Value::String(path) => export_one(ctx, path)?,
        Value::Array(paths) => {
            let mut keys = Vec::with_capacity(paths.len());
            for path in paths {
                let Some(path) = path.as_str() else {
                    return Err(ctx.fail_tag(errors::MISSING_CREDENTIALS));
                };
                keys.push(export_one(ctx, path)?);
            }
            Value::Array(keys)
        }
        _ => unreachable!("shape checked above"),
    };

    let mut result = ctx.result_base();
    result.insert(out::EXPORTED_KEY.to_string(), exported);
    Ok(result)
}

fn export_one(ctx: &FlowContext<'_>, path: &str) -> Step<Value> {
    let path: DerivationPath = path
        .parse()
        .map_err(|_| ctx.fail_tag(errors::MISSING_CREDENTIALS))?;
    let keypair = ctx
        .with_card(|card| card.export_derived(&path, ExportOption::PublicOnly))
        .map_err(|e| ctx.fail(errors::EXPORT_FAILED, e))?;
    Ok(keypair.to_json())
}
