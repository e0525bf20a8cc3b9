use serde_json::{Map, Value};

use crate::flow::context::{FlowContext, FlowInterrupt, Step, actions, errors, keys};

/// Change the PIN, pausing for the new value when absent.
pub(crate) fn change_pin(ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    change(ctx, keys::NEW_PIN, actions::ENTER_NEW_PIN, |ctx, value| {
        ctx.with_card(|card| card.change_pin(value))
    })
}

/// Change the PUK, pausing for the new value when absent.
pub(crate) fn change_puk(ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    change(ctx, keys::NEW_PUK, actions::ENTER_NEW_PUK, |ctx, value| {
        ctx.with_card(|card| card.change_puk(value))
    })
}

/// Change the pairing password, pausing for the new value when absent.
pub(crate) fn change_pairing(ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    change(
        ctx,
        keys::NEW_PAIRING,
        actions::ENTER_NEW_PAIRING,
        |ctx, value| ctx.with_card(|card| card.change_pairing_secret(value)),
    )
}

fn change(
    ctx: &mut FlowContext<'_>,
    key: &'static str,
    action: &'static str,
    apply: impl Fn(&FlowContext<'_>, &str) -> crate::Result<()>,
) -> Step<Map<String, Value>> {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;
    ctx.open_secure_channel_and_authenticate(true)?;

    let value = loop {
        if ctx.cancelled() {
            return Err(FlowInterrupt::Cancelled);
        }
        match ctx.param_str(key) {
            Some(value) => break value,
            None => ctx.pause_and_wait(action, errors::MISSING_CREDENTIALS)?,
        }
    };

    apply(ctx, &value).map_err(|e| ctx.fail(errors::CHANGE_FAILED, e))?;
    Ok(ctx.result_base())
}
