//! Gateway Service Module
//!
//! Owns every registry and turns radio events into radio commands and
//! publications. All handlers run to completion without awaiting; commands
//! and publications are queued on unbounded channels drained elsewhere.

use crate::domain::aggregator::{AggregatorConfig, AggregatorError, TagAggregator};
use crate::domain::angle::DistanceModel;
use crate::domain::locators::LocatorRegistry;
use crate::domain::models::{AddressType, BdAddr, DeviceId, PositionResult};
use crate::domain::settings::{ConnectionParameters, ScannerSettings, Settings};
use crate::estimation::EstimatorFactory;
use crate::infrastructure::bluetooth::{
    connection::{ConnectionState, IqError, SessionConfig},
    protocol::{ConnectionHandle, IqReport, RadioCommand, RadioEvent},
    registry::{ConnectionRegistry, RegistryError},
    scanner::{ScanFilter, ScanVerdict},
};
use crate::infrastructure::publish::{self, PublishError, Publisher};
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Conditions that stop the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("radio command channel closed")]
    LinkClosed,
    #[error("publication failed: {0}")]
    Publish(#[from] PublishError),
}

/// Gateway configuration derived from [`Settings`]
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub multilocator_id: DeviceId,
    pub session: SessionConfig,
    pub aggregator: AggregatorConfig,
    pub discovery_timeout: Option<Duration>,
    pub scanner: ScannerSettings,
    pub connection_parameters: ConnectionParameters,
    pub tag_allowlist: Vec<String>,
    pub aggregate_locally: bool,
}

impl GatewayConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            multilocator_id: DeviceId::new(settings.multilocator_id.as_str()),
            session: SessionConfig {
                geometry: settings.array_type.geometry(),
                filtering_amount: settings.filtering_amount,
                distance: DistanceModel {
                    tx_power_dbm: settings.tag_tx_power_dbm,
                    path_loss_exponent: settings.path_loss_exponent,
                },
            },
            aggregator: AggregatorConfig {
                filtering_amount: settings.filtering_amount,
                estimation_interval_sec: settings.estimation_interval_sec,
            },
            discovery_timeout: settings
                .discovery_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            scanner: settings.scanner.clone(),
            connection_parameters: settings.connection_parameters.clone(),
            tag_allowlist: settings.tag_allowlist.clone(),
            aggregate_locally: settings.aggregate_locally,
        }
    }
}

/// Top-level owner of connection, session and tag state
pub struct GatewayService {
    config: GatewayConfig,
    factory: Rc<dyn EstimatorFactory>,
    commands: mpsc::UnboundedSender<RadioCommand>,
    publisher: Publisher,
    connections: ConnectionRegistry,
    aggregator: TagAggregator,
    scan_filter: ScanFilter,
    gateway_id: Option<DeviceId>,
    scanning: bool,
}

impl GatewayService {
    pub fn new(
        config: GatewayConfig,
        locators: LocatorRegistry,
        factory: Rc<dyn EstimatorFactory>,
        commands: mpsc::UnboundedSender<RadioCommand>,
        publisher: Publisher,
    ) -> Self {
        let aggregator = TagAggregator::new(locators, factory.clone(), config.aggregator);
        let scan_filter = ScanFilter::new(&config.tag_allowlist);
        Self {
            config,
            factory,
            commands,
            publisher,
            connections: ConnectionRegistry::new(),
            aggregator,
            scan_filter,
            gateway_id: None,
            scanning: false,
        }
    }

    pub fn gateway_id(&self) -> Option<&DeviceId> {
        self.gateway_id.as_ref()
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn aggregator(&self) -> &TagAggregator {
        &self.aggregator
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    fn send(&self, command: RadioCommand) -> Result<(), GatewayError> {
        trace!("-> {:?}", command);
        self.commands.send(command).map_err(|_| GatewayError::LinkClosed)
    }

    fn start_scanner(&mut self) -> Result<(), GatewayError> {
        if !self.scanning {
            self.send(RadioCommand::StartScanner)?;
            self.scanning = true;
            debug!("Scanning started");
        }
        Ok(())
    }

    fn stop_scanner(&mut self) -> Result<(), GatewayError> {
        if self.scanning {
            self.send(RadioCommand::StopScanner)?;
            self.scanning = false;
        }
        Ok(())
    }

    /// Dispatch one radio event
    ///
    /// Per-event failures are logged here; only fatal conditions are returned.
    pub fn handle_event(&mut self, event: RadioEvent, now: Instant) -> Result<(), GatewayError> {
        match event {
            RadioEvent::SystemBoot {
                version,
                address,
                address_type,
            } => self.on_boot(&version, address, address_type),
            RadioEvent::ScanReport {
                address,
                address_type,
                packet_type,
                data,
                ..
            } => self.on_scan_report(address, address_type, packet_type, &data),
            RadioEvent::ConnectionOpened {
                connection,
                address,
                address_type,
            } => self.on_connection_opened(connection, address, address_type, now),
            RadioEvent::ConnectionClosed { connection, reason } => {
                self.on_connection_closed(connection, reason)
            }
            RadioEvent::GattService {
                connection,
                service,
                uuid,
            } => {
                if let Some(conn) = self.connections.by_handle_mut(connection) {
                    conn.on_service(service, &uuid);
                }
                Ok(())
            }
            RadioEvent::GattCharacteristic {
                connection,
                characteristic,
                uuid,
            } => {
                if let Some(conn) = self.connections.by_handle_mut(connection) {
                    conn.on_characteristic(characteristic, &uuid);
                }
                Ok(())
            }
            RadioEvent::GattProcedureCompleted { connection, result } => {
                self.on_procedure_completed(connection, result)
            }
            RadioEvent::GattCharacteristicValue {
                connection,
                characteristic,
                value,
            } => self.on_characteristic_value(connection, characteristic, &value),
        }
    }

    fn on_boot(
        &mut self,
        version: &str,
        address: BdAddr,
        address_type: AddressType,
    ) -> Result<(), GatewayError> {
        let id = DeviceId::from_address(&address, address_type);
        info!("Radio booted (version {}), gateway id {}", version, id);
        info!("Bluetooth {} address: {}", address_type, address);
        self.gateway_id = Some(id);

        // A reboot drops every link on the radio side
        let stale: Vec<ConnectionHandle> = self.connections.iter().map(|c| c.handle()).collect();
        for handle in stale {
            let _ = self.connections.remove(handle);
        }
        self.scanning = false;

        let scanner = &self.config.scanner;
        self.send(RadioCommand::ConfigureScanner {
            passive: scanner.passive,
            interval: scanner.interval,
            window: scanner.window,
        })?;
        let p = &self.config.connection_parameters;
        self.send(RadioCommand::SetDefaultConnectionParameters {
            min_interval: p.min_interval,
            max_interval: p.max_interval,
            latency: p.latency,
            timeout: p.timeout,
            min_ce_length: p.min_ce_length,
            max_ce_length: p.max_ce_length,
        })?;
        self.start_scanner()?;
        info!("Start scanning...");
        Ok(())
    }

    fn on_scan_report(
        &mut self,
        address: BdAddr,
        address_type: AddressType,
        packet_type: u8,
        data: &[u8],
    ) -> Result<(), GatewayError> {
        if self.scan_filter.evaluate(&address, address_type, packet_type, data) != ScanVerdict::Connect {
            return Ok(());
        }
        if self.connections.is_full() {
            debug!("Connection table full, not connecting to {}", address);
            return Ok(());
        }
        if self.connections.by_address(&address).is_some() {
            return Ok(());
        }

        self.stop_scanner()?;
        info!("Connecting to tag {}", address);
        self.send(RadioCommand::OpenConnection {
            address,
            address_type,
        })
    }

    fn on_connection_opened(
        &mut self,
        handle: ConnectionHandle,
        address: BdAddr,
        address_type: AddressType,
        now: Instant,
    ) -> Result<(), GatewayError> {
        if self.connections.by_handle(handle).is_some() {
            warn!("Connection {} reopened before close, dropping stale entry", handle);
            let _ = self.connections.remove(handle);
        }

        let command = match self.connections.add(handle, address, address_type, now) {
            Ok(connection) => {
                info!(
                    "Connected to tag {} ({} {}), discovering services",
                    connection.tag_id(),
                    address_type,
                    address
                );
                connection.start_discovery()
            }
            Err(e @ RegistryError::Full(_)) => {
                warn!("{}, closing connection {}", e, handle);
                RadioCommand::CloseConnection { connection: handle }
            }
            Err(e) => {
                error!("Could not register connection {}: {}", handle, e);
                RadioCommand::CloseConnection { connection: handle }
            }
        };
        self.send(command)
    }

    fn on_connection_closed(
        &mut self,
        handle: ConnectionHandle,
        reason: u16,
    ) -> Result<(), GatewayError> {
        info!("Connection {} lost (reason {:#06x})", handle, reason);
        if let Err(e) = self.connections.remove(handle) {
            debug!("{}", e);
        }
        self.scanning = false;
        self.start_scanner()
    }

    fn on_procedure_completed(
        &mut self,
        handle: ConnectionHandle,
        result: u16,
    ) -> Result<(), GatewayError> {
        let Some(connection) = self.connections.by_handle_mut(handle) else {
            return Ok(());
        };

        match connection.on_procedure_completed(result) {
            Ok(Some(command)) => self.send(command),
            Ok(None) => {
                // Look for further tags once this one streams
                if connection.state() == ConnectionState::Running && !self.connections.is_full() {
                    self.start_scanner()?;
                }
                Ok(())
            }
            Err(e) => {
                warn!("Discovery on connection {} failed: {}", handle, e);
                self.close(handle)
            }
        }
    }

    fn on_characteristic_value(
        &mut self,
        handle: ConnectionHandle,
        characteristic: u16,
        value: &[u8],
    ) -> Result<(), GatewayError> {
        let Some(connection) = self.connections.by_handle_mut(handle) else {
            return Ok(());
        };
        if !connection.is_iq_characteristic(characteristic) {
            trace!("Connection {}: value for characteristic {:#x} ignored", handle, characteristic);
            return Ok(());
        }

        let report = match IqReport::parse(value) {
            Ok(report) => report,
            Err(e) => {
                warn!("Connection {}: {}", handle, e);
                return Ok(());
            }
        };
        if report.samples.is_empty() {
            return Ok(());
        }
        let locator_id =
            DeviceId::from_address(&report.locator_address, report.locator_address_type);
        if self.aggregator.locators().slot_of(&locator_id).is_none() {
            debug!("Connection {}: failed to find locator {}", handle, locator_id);
            return Ok(());
        }

        let observation =
            match connection.handle_iq_report(&report, self.factory.as_ref(), &self.config.session) {
                Ok(Some(observation)) => observation,
                Ok(None) => return Ok(()),
                Err(IqError::SessionLimit(addr)) => {
                    warn!("Connection {}: too many locators, ignoring {}", handle, addr);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connection {}: {}", handle, e);
                    return Ok(());
                }
            };

        let publication = self.publisher.publish_angle(&observation)?;
        if self.config.aggregate_locally {
            self.on_message(&publication.topic, &publication.payload)?;
        }
        Ok(())
    }

    /// Feed an angle publication into the tag aggregator
    ///
    /// Topics other than angle topics are ignored.
    pub fn on_message(
        &mut self,
        topic: &str,
        payload: &str,
    ) -> Result<Option<PositionResult>, GatewayError> {
        if publish::scan_angle_topic(topic).is_none() {
            trace!("Ignoring message on {}", topic);
            return Ok(None);
        }
        let observation = match publish::decode_angle(topic, payload) {
            Ok(observation) => observation,
            Err(e) => {
                warn!("Malformed angle message on {}: {}", topic, e);
                return Ok(None);
            }
        };

        match self.aggregator.ingest(observation) {
            Ok(Some(result)) => {
                self.publisher
                    .publish_position(&self.config.multilocator_id, &result)?;
                Ok(Some(result))
            }
            Ok(None) => Ok(None),
            Err(AggregatorError::UnknownLocator(id)) => {
                debug!("Angle from unconfigured locator {} ignored", id);
                Ok(None)
            }
            Err(e) => {
                warn!("{}", e);
                Ok(None)
            }
        }
    }

    fn close(&mut self, handle: ConnectionHandle) -> Result<(), GatewayError> {
        self.send(RadioCommand::CloseConnection { connection: handle })?;
        if let Err(e) = self.connections.remove(handle) {
            debug!("{}", e);
        }
        Ok(())
    }

    /// Close connections whose discovery has not finished in time
    pub fn reap_stalled(&mut self, now: Instant) -> Result<usize, GatewayError> {
        let Some(timeout) = self.config.discovery_timeout else {
            return Ok(0);
        };
        let stalled: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|c| c.is_discovery_overdue(now, timeout))
            .map(|c| c.handle())
            .collect();

        for handle in &stalled {
            warn!("Connection {} stalled in discovery, closing", handle);
            self.close(*handle)?;
        }
        if !stalled.is_empty() {
            self.start_scanner()?;
        }
        Ok(stalled.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Coordinate, Orientation};
    use crate::domain::settings::{LocatorConfig, MAX_NUM_LOCATORS};
    use crate::estimation::testing::StubFactory;
    use crate::infrastructure::bluetooth::protocol::tests::{iq_advertisement, iq_report_bytes};
    use crate::infrastructure::bluetooth::protocol::{IQ_CHARACTERISTIC_UUID, IQ_SERVICE_UUID};
    use crate::infrastructure::publish::Publication;

    const TAG: BdAddr = BdAddr([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    const LOCATOR: [u8; 6] = [0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F];
    const HANDLE: ConnectionHandle = ConnectionHandle(1);
    const IQ_CHAR: u16 = 0x22;

    struct Harness {
        service: GatewayService,
        commands: mpsc::UnboundedReceiver<RadioCommand>,
        publications: mpsc::UnboundedReceiver<Publication>,
        factory: StubFactory,
        now: Instant,
    }

    impl Harness {
        fn new(locator_ids: &[String]) -> Self {
            let mut settings = Settings::default();
            settings.locators = locator_ids
                .iter()
                .map(|id| LocatorConfig {
                    id: id.clone(),
                    coordinate: Coordinate::default(),
                    orientation: Orientation::default(),
                })
                .collect();
            let factory = StubFactory::new();
            let (tx, commands) = mpsc::unbounded_channel();
            let (ptx, publications) = mpsc::unbounded_channel();
            let service = GatewayService::new(
                GatewayConfig::from_settings(&settings),
                LocatorRegistry::from_config(&settings.locators),
                Rc::new(factory.clone()),
                tx,
                Publisher::new(ptx),
            );
            Self {
                service,
                commands,
                publications,
                factory,
                now: Instant::now(),
            }
        }

        fn event(&mut self, event: RadioEvent) {
            self.service.handle_event(event, self.now).unwrap();
        }

        fn drain_commands(&mut self) -> Vec<RadioCommand> {
            let mut out = Vec::new();
            while let Ok(command) = self.commands.try_recv() {
                out.push(command);
            }
            out
        }

        fn open(&mut self, handle: ConnectionHandle) {
            self.event(RadioEvent::ConnectionOpened {
                connection: handle,
                address: TAG,
                address_type: AddressType::Public,
            });
        }

        fn connect_running(&mut self, handle: ConnectionHandle) {
            self.open(handle);
            self.event(RadioEvent::GattService {
                connection: handle,
                service: 0x10,
                uuid: IQ_SERVICE_UUID.to_vec(),
            });
            self.event(RadioEvent::GattProcedureCompleted {
                connection: handle,
                result: 0,
            });
            self.event(RadioEvent::GattCharacteristic {
                connection: handle,
                characteristic: IQ_CHAR,
                uuid: IQ_CHARACTERISTIC_UUID.to_vec(),
            });
            self.event(RadioEvent::GattProcedureCompleted {
                connection: handle,
                result: 0,
            });
            self.event(RadioEvent::GattProcedureCompleted {
                connection: handle,
                result: 0,
            });
        }

        fn iq_value(&mut self, handle: ConnectionHandle, locator: [u8; 6]) {
            self.event(RadioEvent::GattCharacteristicValue {
                connection: handle,
                characteristic: IQ_CHAR,
                value: iq_report_bytes(locator, 37, -45, &[3i8; 160]),
            });
        }
    }

    fn locator_id(address: [u8; 6]) -> String {
        DeviceId::from_address(&BdAddr(address), AddressType::Public).to_string()
    }

    #[test]
    fn test_boot_configures_and_scans() {
        let mut h = Harness::new(&[locator_id(LOCATOR)]);
        h.event(RadioEvent::SystemBoot {
            version: "7.0".to_string(),
            address: BdAddr([0xAA; 6]),
            address_type: AddressType::Public,
        });
        assert_eq!(h.service.gateway_id().unwrap().as_str(), "ble-pd-AAAAAAAAAAAA");
        assert_eq!(
            h.drain_commands(),
            vec![
                RadioCommand::ConfigureScanner {
                    passive: true,
                    interval: 16,
                    window: 16
                },
                RadioCommand::SetDefaultConnectionParameters {
                    min_interval: 80,
                    max_interval: 80,
                    latency: 0,
                    timeout: 100,
                    min_ce_length: 0,
                    max_ce_length: 0xFFFF
                },
                RadioCommand::StartScanner,
            ]
        );
        assert!(h.service.is_scanning());
    }

    #[test]
    fn test_boot_drops_live_connections() {
        let mut h = Harness::new(&[locator_id(LOCATOR)]);
        h.connect_running(HANDLE);
        h.drain_commands();
        assert_eq!(h.service.connections().len(), 1);

        h.event(RadioEvent::SystemBoot {
            version: String::new(),
            address: BdAddr([0xAA; 6]),
            address_type: AddressType::Public,
        });
        assert!(h.service.connections().is_empty());
        let commands = h.drain_commands();
        assert!(matches!(commands[0], RadioCommand::ConfigureScanner { .. }));
        assert_eq!(commands.last(), Some(&RadioCommand::StartScanner));
        assert!(h.service.is_scanning());

        h.iq_value(HANDLE, LOCATOR);
        assert!(h.publications.try_recv().is_err());
    }

    #[test]
    fn test_scan_report_opens_connection_once() {
        let mut h = Harness::new(&[locator_id(LOCATOR)]);
        h.event(RadioEvent::SystemBoot {
            version: String::new(),
            address: BdAddr([0xAA; 6]),
            address_type: AddressType::Public,
        });
        h.drain_commands();

        let report = RadioEvent::ScanReport {
            address: TAG,
            address_type: AddressType::Public,
            packet_type: 0,
            rssi: -50,
            data: iq_advertisement(),
        };
        h.event(report.clone());
        assert_eq!(
            h.drain_commands(),
            vec![
                RadioCommand::StopScanner,
                RadioCommand::OpenConnection {
                    address: TAG,
                    address_type: AddressType::Public
                }
            ]
        );

        h.open(HANDLE);
        h.drain_commands();
        h.event(report);
        assert!(h.drain_commands().is_empty());
    }

    #[test]
    fn test_full_discovery_then_position() {
        let mut h = Harness::new(&[locator_id(LOCATOR)]);
        h.connect_running(HANDLE);
        let connection = h.service.connections().by_handle(HANDLE).unwrap();
        assert_eq!(connection.state(), ConnectionState::Running);

        let commands = h.drain_commands();
        assert_eq!(
            commands[..3],
            [
                RadioCommand::DiscoverPrimaryServicesByUuid {
                    connection: HANDLE,
                    uuid: IQ_SERVICE_UUID.to_vec()
                },
                RadioCommand::DiscoverCharacteristicsByUuid {
                    connection: HANDLE,
                    service: 0x10,
                    uuid: IQ_CHARACTERISTIC_UUID.to_vec()
                },
                RadioCommand::SetCharacteristicNotification {
                    connection: HANDLE,
                    characteristic: IQ_CHAR,
                    enable: true
                },
            ]
        );

        h.iq_value(HANDLE, LOCATOR);
        let angle = h.publications.try_recv().unwrap();
        assert_eq!(
            angle.topic,
            format!("locator/{}/tag/ble-pd-060504030201/angle", locator_id(LOCATOR))
        );
        let position = h.publications.try_recv().unwrap();
        assert_eq!(
            position.topic,
            "multilocator/multilocator/tag/ble-pd-060504030201/position"
        );
        assert_eq!(position.payload, "x=1;y=2;z=3");
        assert_eq!(h.factory.distance_calls(), 1);
    }

    #[test]
    fn test_iq_before_running_is_ignored() {
        let mut h = Harness::new(&[locator_id(LOCATOR)]);
        h.open(HANDLE);
        h.iq_value(HANDLE, LOCATOR);
        assert!(h.publications.try_recv().is_err());
        assert_eq!(h.factory.log.borrow().angle_estimators, 0);
    }

    #[test]
    fn test_unconfigured_locators_are_dropped() {
        let mut h = Harness::new(&[locator_id(LOCATOR)]);
        h.connect_running(HANDLE);

        for i in 0..MAX_NUM_LOCATORS as u8 + 1 {
            h.iq_value(HANDLE, [0x40 + i; 6]);
        }
        assert!(h.publications.try_recv().is_err());
        assert_eq!(h.service.connections().by_handle(HANDLE).unwrap().session_count(), 0);
        assert_eq!(h.factory.log.borrow().angle_estimators, 0);

        h.iq_value(HANDLE, LOCATOR);
        assert!(h.publications.try_recv().unwrap().topic.ends_with("/angle"));
        assert!(h.publications.try_recv().unwrap().topic.ends_with("/position"));
    }

    #[test]
    fn test_two_locators_need_quorum() {
        let second = [0x20; 6];
        let mut h = Harness::new(&[locator_id(LOCATOR), locator_id(second)]);
        h.connect_running(HANDLE);

        h.iq_value(HANDLE, LOCATOR);
        assert!(h.publications.try_recv().unwrap().topic.ends_with("/angle"));
        assert!(h.publications.try_recv().is_err());

        h.iq_value(HANDLE, second);
        assert!(h.publications.try_recv().unwrap().topic.ends_with("/angle"));
        assert!(h.publications.try_recv().unwrap().topic.ends_with("/position"));
        assert_eq!(h.factory.distance_calls(), 0);
    }

    #[test]
    fn test_close_tears_down_and_rescans() {
        let mut h = Harness::new(&[locator_id(LOCATOR)]);
        h.connect_running(HANDLE);
        h.iq_value(HANDLE, LOCATOR);
        h.drain_commands();

        h.event(RadioEvent::ConnectionClosed {
            connection: HANDLE,
            reason: 0x08,
        });
        assert!(h.service.connections().is_empty());
        assert!(h.drain_commands().contains(&RadioCommand::StartScanner));

        // Late events for the closed handle are dropped
        h.iq_value(HANDLE, LOCATOR);
        h.event(RadioEvent::GattProcedureCompleted {
            connection: HANDLE,
            result: 0,
        });
        assert!(h.drain_commands().is_empty());
    }

    #[test]
    fn test_reopened_handle_starts_fresh() {
        let mut h = Harness::new(&[locator_id(LOCATOR)]);
        h.connect_running(HANDLE);
        h.open(HANDLE);
        let connection = h.service.connections().by_handle(HANDLE).unwrap();
        assert_eq!(connection.state(), ConnectionState::DiscoverServices);
        assert_eq!(h.service.connections().len(), 1);
    }

    #[test]
    fn test_failed_discovery_closes_connection() {
        let mut h = Harness::new(&[locator_id(LOCATOR)]);
        h.open(HANDLE);
        h.drain_commands();
        h.event(RadioEvent::GattProcedureCompleted {
            connection: HANDLE,
            result: 0,
        });
        assert_eq!(
            h.drain_commands(),
            vec![RadioCommand::CloseConnection { connection: HANDLE }]
        );
        assert!(h.service.connections().is_empty());
    }

    #[test]
    fn test_stalled_discovery_is_reaped() {
        let mut h = Harness::new(&[locator_id(LOCATOR)]);
        h.open(HANDLE);
        h.drain_commands();

        assert_eq!(h.service.reap_stalled(h.now + Duration::from_secs(5)).unwrap(), 0);
        assert_eq!(h.service.reap_stalled(h.now + Duration::from_secs(11)).unwrap(), 1);
        assert!(h.service.connections().is_empty());
        assert_eq!(
            h.drain_commands(),
            vec![
                RadioCommand::CloseConnection { connection: HANDLE },
                RadioCommand::StartScanner
            ]
        );
    }

    #[test]
    fn test_on_message_from_remote_locator() {
        let mut h = Harness::new(&["remote".to_string()]);
        let result = h
            .service
            .on_message(
                "locator/remote/tag/t1/angle",
                "azimuth=1;elevation=2;distance=3;rssi=-50;channel=37;sequence=1",
            )
            .unwrap()
            .unwrap();
        assert_eq!(result.tag_id, DeviceId::from("t1"));
        assert!(h.publications.try_recv().unwrap().topic.ends_with("/position"));

        assert!(h
            .service
            .on_message("multilocator/m/tag/t1/position", "x=1;y=2;z=3")
            .unwrap()
            .is_none());
        assert!(h.service.on_message("locator/remote/tag/t1/angle", "garbage").unwrap().is_none());
    }

    #[test]
    fn test_closed_command_channel_is_fatal() {
        let h = Harness::new(&[locator_id(LOCATOR)]);
        let Harness { mut service, commands, .. } = h;
        drop(commands);
        let result = service.handle_event(
            RadioEvent::SystemBoot {
                version: String::new(),
                address: BdAddr::default(),
                address_type: AddressType::Public,
            },
            Instant::now(),
        );
        assert!(matches!(result, Err(GatewayError::LinkClosed)));
    }
}
