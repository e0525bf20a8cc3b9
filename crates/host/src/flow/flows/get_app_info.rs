use serde_json::{Map, Value};

use crate::command_set::CommandSet;
use crate::flow::context::{FlowContext, FlowInterrupt, Step, errors, keys, out};

/// Read card info. With `"factory reset": true` the card is wiped first;
/// the result is emitted before re-detection of the wiped card completes.
pub(crate) fn run(ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;

    if ctx.param_bool(keys::FACTORY_RESET) {
        if let Err(e) = ctx.with_card(CommandSet::factory_reset) {
            return Err(ctx.fail(errors::FACTORY_RESET_FAILED, e));
        }
        ctx.snapshot.key_uid = None;
        ctx.force_scan();
        return Ok(ctx.result_base());
    }

    // Authentication here is best-effort: an unpaired or slotless card
    // still yields the basic info.
    match ctx.open_secure_channel_and_authenticate(false) {
        Ok(()) => {
            let mut result = ctx.result_base();
            result.insert(out::PAIRED.to_string(), Value::Bool(true));
            Ok(result)
        }
        Err(interrupt @ (FlowInterrupt::Cancelled | FlowInterrupt::Restart)) => Err(interrupt),
        Err(FlowInterrupt::Failed { .. }) => {
            let mut result = ctx.result_base();
            result.insert(out::PAIRED.to_string(), Value::Bool(false));
            Ok(result)
        }
    }
}
