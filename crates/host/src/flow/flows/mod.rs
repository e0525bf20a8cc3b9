//! The concrete flow bodies.
//!
//! Every flow shares the prelude: wait for a card, SELECT, and (for most)
//! open the secure channel and authenticate. Bodies are straight-line code
//! over the flow context; pauses and restarts propagate as interrupts.

mod change_credentials;
mod export_public;
mod get_app_info;
mod load_account;
mod login;
mod metadata;
mod recover_account;
mod sign;

use serde_json::{Map, Value};

use super::FlowType;
use super::context::{FlowContext, Step};

pub(crate) fn execute(flow_type: FlowType, ctx: &mut FlowContext<'_>) -> Step<Map<String, Value>> {
    match flow_type {
        FlowType::GetAppInfo => get_app_info::run(ctx),
        FlowType::RecoverAccount => recover_account::run(ctx),
        FlowType::LoadAccount => load_account::run(ctx),
        FlowType::Login => login::run(ctx),
        FlowType::ExportPublic => export_public::run(ctx),
        FlowType::Sign => sign::run(ctx),
        FlowType::ChangePin => change_credentials::change_pin(ctx),
        FlowType::ChangePuk => change_credentials::change_puk(ctx),
        FlowType::ChangePairing => change_credentials::change_pairing(ctx),
        FlowType::GetMetadata => metadata::get(ctx),
        FlowType::StoreMetadata => metadata::store(ctx),
    }
}
