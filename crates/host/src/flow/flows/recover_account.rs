use serde_json::{Map, Value};

use crate::command_set::{ExportOption, parse_path};
use crate::constants::paths;
use crate::flow::context::{FlowContext, Step, errors, out};
use crate::types::Keypair;

/// Export the full key set of an existing account.
pub(crate) fn run(ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    ctx.wait_for_card()?;
    let info = ctx.select_keycard()?;
    ctx.open_secure_channel_and_authenticate(true)?;
    ctx.require_keys()?;

    let extended = info.version.supports_extended_export();
    let wallet_root_option = if extended {
        ExportOption::ExtendedPublic
    } else {
        ExportOption::PublicOnly
    };

    let export = |path: &str, what: ExportOption| -> Step<Keypair> {
        ctx.with_card(|card| card.export_derived(&parse_path(path)?, what))
            .map_err(|e| ctx.fail(errors::EXPORT_FAILED, e))
    };

    let encryption = export(paths::ENCRYPTION, ExportOption::PrivateAndPublic)?;
    let whisper = export(paths::WHISPER, ExportOption::PrivateAndPublic)?;
    let eip1581 = export(paths::EIP1581, ExportOption::PublicOnly)?;
    let wallet_root = export(paths::WALLET_ROOT, wallet_root_option)?;
    let wallet = export(paths::WALLET, ExportOption::PublicOnly)?;
    let master = export(paths::MASTER, ExportOption::PublicOnly)?;

    let mut result = ctx.result_base();
    result.insert(out::ENCRYPTION_KEY.to_string(), encryption.to_json());
    result.insert(out::WHISPER_KEY.to_string(), whisper.to_json());
    result.insert(out::EIP1581_KEY.to_string(), eip1581.to_json());
    result.insert(out::WALLET_ROOT_KEY.to_string(), wallet_root.to_json());
    result.insert(out::WALLET_KEY.to_string(), wallet.to_json());
    result.insert(out::MASTER_KEY.to_string(), master.to_json());
    Ok(result)
}
