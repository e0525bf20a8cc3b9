use serde_json::{Map, Value};

use crate::constants::DEFAULT_PAIRING_PASSWORD;
use crate::crypto;
use crate::flow::context::{FlowContext, Step, actions, errors, keys, out};
use crate::secrets::Secrets;

/// Initialize a card if needed, then load a BIP39 account onto it.
///
/// A pre-initialized card pauses for new credentials, INITs, and re-detects
/// itself before continuing. When no mnemonic is supplied the card
/// generates one and the flow pauses with the word indices until the user
/// confirms the phrase.
pub(crate) fn run(ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    ctx.wait_for_card()?;
    let mut info = ctx.select_keycard()?;

    if !info.initialized {
        ctx.pause_and_wait(actions::ENTER_NEW_PIN, errors::REQUIRE_INIT)?;

        let new_pin = ctx
            .param_str(keys::NEW_PIN)
            .ok_or_else(|| ctx.fail_tag(errors::MISSING_CREDENTIALS))?;
        let new_puk = ctx
            .param_str(keys::NEW_PUK)
            .ok_or_else(|| ctx.fail_tag(errors::MISSING_CREDENTIALS))?;
        let pairing_pass = ctx
            .param_str(keys::PAIRING_PASS)
            .unwrap_or_else(|| DEFAULT_PAIRING_PASSWORD.to_string());

        let secrets = Secrets::new(&new_pin, &new_puk, &pairing_pass)
            .map_err(|e| ctx.fail(errors::MISSING_CREDENTIALS, e))?;
        ctx.with_card(|card| card.init(&secrets))
            .map_err(|e| ctx.fail(errors::CARD_ERROR, e))?;

        // The INIT changed the card's identity; reconnect from scratch.
        ctx.reconnect_card();
        ctx.wait_for_card()?;
        info = ctx.select_keycard()?;

        // The freshly set PIN authenticates the rest of the flow.
        ctx.set_param(keys::PIN, Value::String(new_pin));
    }

    ctx.open_secure_channel_and_authenticate(true)?;

    if info.key_uid.is_some() && !ctx.param_bool(keys::OVERWRITE) {
        ctx.pause_and_restart(actions::SWAP_CARD, errors::HAS_KEYS)?;
    }

    let mnemonic = match ctx.param_str(keys::MNEMONIC) {
        Some(mnemonic) => mnemonic,
        None => {
            let word_count = ctx.param_u64(keys::MNEMONIC_LEN).unwrap_or(12);
            let checksum_words = (word_count / 3) as u8;
            let indexes = ctx
                .with_card(|card| card.generate_mnemonic(checksum_words))
                .map_err(|e| ctx.fail(errors::GENERATE_FAILED, e))?;

            let mut status = Map::new();
            status.insert(
                out::MNEMONIC_INDEXES.to_string(),
                Value::Array(indexes.iter().map(|&i| Value::from(i)).collect()),
            );
            ctx.pause_and_wait_with_status(actions::ENTER_MNEMONIC, errors::LOADING_KEYS, status)?;

            ctx.param_str(keys::MNEMONIC)
                .ok_or_else(|| ctx.fail_tag(errors::MISSING_CREDENTIALS))?
        }
    };

    let seed = crypto::bip39_seed(&mnemonic, "");
    let key_uid = ctx
        .with_card(|card| card.load_seed(&seed))
        .map_err(|e| ctx.fail(errors::LOAD_FAILED, e))?;
    ctx.snapshot.key_uid = Some(hex::encode(key_uid));

    Ok(ctx.result_base())
}
