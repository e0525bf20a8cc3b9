use serde_json::{Map, Value};

use crate::command_set::{ExportOption, parse_path};
use crate::constants::paths;
use crate::flow::context::{FlowContext, Step, errors, out};

/// Export the Whisper and encryption keys for a login.
///
/// The Whisper export runs first and seeds the card's current-key pointer;
/// the encryption export leaves it alone.
pub(crate) fn run(ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;
    ctx.open_secure_channel_and_authenticate(true)?;
    ctx.require_keys()?;

    let whisper = ctx
        .with_card(|card| {
            card.export_derived(&parse_path(paths::WHISPER)?, ExportOption::PrivateAndPublic)
        })
        .map_err(|e| ctx.fail(errors::EXPORT_FAILED, e))?;
    let encryption = ctx
        .with_card(|card| {
            card.export_derived(&parse_path(paths::ENCRYPTION)?, ExportOption::PrivateAndPublic)
        })
        .map_err(|e| ctx.fail(errors::EXPORT_FAILED, e))?;

    let mut result = ctx.result_base();
    result.insert(out::WHISPER_KEY.to_string(), whisper.to_json());
    result.insert(out::ENCRYPTION_KEY.to_string(), encryption.to_json());
    Ok(result)
}
