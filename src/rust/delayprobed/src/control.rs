use crate::feature::{FeatureController, FeatureError};
use anyhow::{anyhow, Result};
use delayprobe_bus::{ApiError, BusRequest, BusResponse, ProbeParams};
use delayprobe_config::{Config, FlowVariant, RecordFlags};
use tracing::info;

impl From<FeatureError> for ApiError {
    fn from(error: FeatureError) -> Self {
        match error {
            FeatureError::NotConfigured => ApiError::CannotEnableDisableFeature,
            FeatureError::DifferentVariant | FeatureError::AlreadyEnabled => {
                ApiError::EntryAlreadyExists
            }
            FeatureError::NotEnabled => ApiError::NoSuchEntry,
            FeatureError::InvalidValue => ApiError::InvalidValue,
            FeatureError::InvalidInterface => ApiError::InvalidSwIfIndex,
            FeatureError::Unsupported => ApiError::Unsupported,
        }
    }
}

fn ack_or_error(result: Result<(), FeatureError>) -> BusResponse {
    match result {
        Ok(()) => BusResponse::Ack,
        Err(e) => BusResponse::Error(e.into()),
    }
}

/// Answers each request in order.
pub fn handle_bus_requests(
    controller: &FeatureController,
    requests: &[BusRequest],
    responses: &mut Vec<BusResponse>,
) {
    for req in requests.iter() {
        responses.push(match req {
            BusRequest::Ping => BusResponse::Ack,
            BusRequest::InterfaceAddDel {
                sw_if_index,
                which,
                direction,
                is_add,
            } => ack_or_error(controller.interface_add_del(
                *sw_if_index,
                *which,
                *direction,
                *is_add,
            )),
            BusRequest::SetParams {
                record_flags,
                active_timer,
                passive_timer,
            } => ack_or_error(
                controller
                    .set_params(*record_flags, *active_timer, *passive_timer)
                    .map(|_| ()),
            ),
            BusRequest::GetParams => {
                let params = controller.get_params();
                BusResponse::Params(ProbeParams {
                    record_flags: params.record,
                    active_timer: params.active_timer,
                    passive_timer: params.passive_timer,
                })
            }
            BusRequest::InterfaceDump { sw_if_index } => {
                BusResponse::InterfaceDetails(controller.dump_interfaces(*sw_if_index))
            }
            BusRequest::ShowTable => BusResponse::FlowTable(controller.show_table()),
            BusRequest::ShowStatistics => BusResponse::Statistics(controller.show_statistics()),
        });
    }
}

/// Applies the `[params]` and `[[interfaces]]` sections of the
/// configuration file.
pub fn apply_startup_config(controller: &FeatureController, config: &Config) -> Result<()> {
    let Some(params) = &config.params else {
        return Ok(());
    };
    let record = RecordFlags::from_names(&params.record)
        .ok_or_else(|| anyhow!("Unknown record layer in {:?}", params.record))?;
    controller.set_params(record, params.active_timer, params.passive_timer)?;
    for interface in config.interfaces.iter() {
        controller.interface_add_del(
            interface.sw_if_index,
            FlowVariant::Srh,
            interface.direction,
            true,
        )?;
    }
    info!(
        "Applied startup configuration ({} interfaces)",
        config.interfaces.len()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::test_context::context;
    use crate::exporter::capture::CaptureSink;
    use delayprobe_config::FlowDirection;
    use std::sync::Arc;

    fn controller() -> FeatureController {
        let (ctx, _) = context(1, 4, 16, Arc::new(CaptureSink::default()));
        FeatureController::new(ctx)
    }

    fn handle(controller: &FeatureController, requests: &[BusRequest]) -> Vec<BusResponse> {
        let mut responses = Vec::new();
        handle_bus_requests(controller, requests, &mut responses);
        responses
    }

    #[test]
    fn errors_carry_api_codes() {
        let controller = controller();
        let enable = BusRequest::InterfaceAddDel {
            sw_if_index: 3,
            which: FlowVariant::Srh,
            direction: FlowDirection::Both,
            is_add: true,
        };
        let responses = handle(
            &controller,
            &[
                enable.clone(),
                BusRequest::SetParams {
                    record_flags: RecordFlags::L3,
                    active_timer: None,
                    passive_timer: None,
                },
                enable.clone(),
                enable,
                BusRequest::InterfaceAddDel {
                    sw_if_index: 99,
                    which: FlowVariant::Srh,
                    direction: FlowDirection::Rx,
                    is_add: true,
                },
            ],
        );
        assert_eq!(
            responses,
            vec![
                BusResponse::Error(ApiError::CannotEnableDisableFeature),
                BusResponse::Ack,
                BusResponse::Ack,
                BusResponse::Error(ApiError::EntryAlreadyExists),
                BusResponse::Error(ApiError::InvalidSwIfIndex),
            ]
        );
    }

    #[test]
    fn get_params_before_and_after_set() {
        let controller = controller();
        let responses = handle(
            &controller,
            &[
                BusRequest::GetParams,
                BusRequest::SetParams {
                    record_flags: RecordFlags::L3,
                    active_timer: Some(30),
                    passive_timer: Some(10),
                },
                BusRequest::SetParams {
                    record_flags: RecordFlags::L3,
                    active_timer: Some(5),
                    passive_timer: None,
                },
                BusRequest::GetParams,
            ],
        );
        assert_eq!(
            responses[0],
            BusResponse::Params(ProbeParams {
                record_flags: RecordFlags::empty(),
                active_timer: 15,
                passive_timer: 120,
            })
        );
        assert_eq!(responses[1], BusResponse::Error(ApiError::InvalidValue));
        assert_eq!(responses[2], BusResponse::Ack);
        assert_eq!(
            responses[3],
            BusResponse::Params(ProbeParams {
                record_flags: RecordFlags::L3,
                active_timer: 5,
                passive_timer: 120,
            })
        );
    }

    #[test]
    fn startup_config_enables_interfaces() {
        let controller = controller();
        let config = Config::load_from_string(
            r#"
version = "1.0"
workers = 1

[table]
log2_size = 4
max_interfaces = 16

[exporter]
collector_address = "192.0.2.10"
source_address = "192.0.2.1"

[params]
record = ["l3"]
active_timer = 10
passive_timer = 60

[[interfaces]]
sw_if_index = 4
direction = "both"
"#,
        )
        .unwrap();
        apply_startup_config(&controller, &config).unwrap();
        let responses = handle(
            &controller,
            &[BusRequest::InterfaceDump { sw_if_index: None }],
        );
        let BusResponse::InterfaceDetails(details) = &responses[0] else {
            panic!("unexpected response {responses:?}");
        };
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].sw_if_index, 4);
        assert_eq!(details[0].direction, FlowDirection::Both);
        assert_eq!(controller.get_params().active_timer, 10);
    }
}
