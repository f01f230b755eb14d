//! Service-control based process control.
//!
//! Registration, start, stop and deletion go through `sc.exe`. Inside the
//! daemon, `run` connects to the service control manager from a dispatcher
//! thread; the control handler records the last control message and the
//! loop reads it once per tick. Status goes back through the service status
//! handle. A `run` started from a console, outside the service manager,
//! listens to console control events instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
#[cfg(windows)]
use once_cell::sync::OnceCell;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{DaemonizeOutcome, LaunchCommand, PlatformFamily, ProcessController, Requirement};
use crate::descriptor::DaemonDescriptor;
use crate::error::DaemonError;

/// `sc` exit code for a service that does not exist.
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;

/// Display name prefix used when registering a service.
const DISPLAY_PREFIX: &str = "Lifeline Daemon - ";

/// How long `daemonize` waits for the service manager to call back.
#[cfg(windows)]
const DISPATCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

/// Last control message dispatched to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlMessage {
    Idle = 0,
    Continue = 1,
    Interrogate = 2,
    Stop = 3,
    Shutdown = 4,
    Other = 5,
}

impl ControlMessage {
    fn is_stop(self) -> bool {
        matches!(self, ControlMessage::Stop | ControlMessage::Shutdown)
    }
}

impl From<u8> for ControlMessage {
    fn from(v: u8) -> Self {
        match v {
            0 => ControlMessage::Idle,
            1 => ControlMessage::Continue,
            2 => ControlMessage::Interrogate,
            3 => ControlMessage::Stop,
            4 => ControlMessage::Shutdown,
            _ => ControlMessage::Other,
        }
    }
}

/// Shared cell holding the last control message.
#[derive(Debug, Clone, Default)]
pub struct ControlCell {
    last: Arc<AtomicU8>,
    stop: Arc<Notify>,
}

impl ControlCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: ControlMessage) {
        self.last.store(message as u8, Ordering::SeqCst);
        if message.is_stop() {
            self.stop.notify_one();
        }
    }

    pub fn last(&self) -> ControlMessage {
        ControlMessage::from(self.last.load(Ordering::SeqCst))
    }

    /// Wait until a stop or shutdown message has been recorded.
    pub async fn stopped(&self) {
        if self.last().is_stop() {
            return;
        }
        self.stop.notified().await;
    }
}

/// Service state as reported by `sc query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

impl ServiceState {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ServiceState::Stopped),
            2 => Some(ServiceState::StartPending),
            3 => Some(ServiceState::StopPending),
            4 => Some(ServiceState::Running),
            5 => Some(ServiceState::ContinuePending),
            6 => Some(ServiceState::PausePending),
            7 => Some(ServiceState::Paused),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            ServiceState::Stopped => 1,
            ServiceState::StartPending => 2,
            ServiceState::StopPending => 3,
            ServiceState::Running => 4,
            ServiceState::ContinuePending => 5,
            ServiceState::PausePending => 6,
            ServiceState::Paused => 7,
        }
    }
}

/// Parse the `STATE : 4  RUNNING` line of `sc query` output.
pub fn parse_sc_state(output: &str) -> Option<ServiceState> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "STATE" {
            return None;
        }
        value
            .split_whitespace()
            .next()
            .and_then(|code| code.parse().ok())
            .and_then(ServiceState::from_code)
    })
}

#[cfg(windows)]
type StatusHandle = windows_service::service_control_handler::ServiceStatusHandle;

/// Sends status updates to the service manager once connected.
#[derive(Debug, Clone)]
struct StatusReporter {
    #[cfg(windows)]
    handle: Arc<OnceCell<StatusHandle>>,
    last: Arc<AtomicU8>,
}

impl StatusReporter {
    fn new() -> Self {
        Self {
            #[cfg(windows)]
            handle: Arc::new(OnceCell::new()),
            last: Arc::new(AtomicU8::new(ServiceState::StartPending.code())),
        }
    }

    #[cfg(windows)]
    fn attach(&self, handle: StatusHandle) {
        if self.handle.set(handle).is_err() {
            warn!("Service status handle already attached");
        }
    }

    fn report(&self, state: ServiceState) {
        self.last.store(state.code(), Ordering::SeqCst);

        #[cfg(windows)]
        {
            if let Some(handle) = self.handle.get() {
                if let Err(e) = handle.set_service_status(service::status(state)) {
                    warn!("Could not report service state {:?}: {}", state, e);
                }
            }
        }
    }

    fn last(&self) -> Option<ServiceState> {
        ServiceState::from_code(u32::from(self.last.load(Ordering::SeqCst)))
    }
}

/// Process control through the Windows service manager.
#[derive(Debug, Clone)]
pub struct WindowsController {
    launcher: LaunchCommand,
    control: ControlCell,
    status: StatusReporter,
}

impl WindowsController {
    pub fn new(launcher: LaunchCommand) -> Self {
        Self {
            launcher,
            control: ControlCell::new(),
            status: StatusReporter::new(),
        }
    }

    /// Cell the control handler writes into.
    pub fn control(&self) -> &ControlCell {
        &self.control
    }

    /// Status last reported to the service manager.
    pub fn reported_state(&self) -> Option<ServiceState> {
        self.status.last()
    }

    fn report(&self, state: ServiceState) {
        self.status.report(state);
    }

    /// Service key for a daemon; service names may not hold path separators.
    pub fn service_name(descriptor: &DaemonDescriptor) -> String {
        descriptor.sanitized_name()
    }

    async fn sc(&self, args: &[&str]) -> Result<std::process::Output, DaemonError> {
        debug!("sc {}", args.join(" "));
        tokio::process::Command::new("sc.exe")
            .args(args)
            .output()
            .await
            .map_err(|e| DaemonError::ProcessControl(format!("Failed to execute sc.exe: {}", e)))
    }

    async fn sc_checked(&self, args: &[&str], action: &str) -> Result<(), DaemonError> {
        let output = self.sc(args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Err(DaemonError::ProcessControl(format!(
            "Failed to {}: {}",
            action,
            stdout.trim()
        )))
    }

    /// Current service state, `None` when the service is not registered.
    pub async fn query_state(
        &self,
        descriptor: &DaemonDescriptor,
    ) -> Result<Option<ServiceState>, DaemonError> {
        let service = Self::service_name(descriptor);
        let output = self.sc(&["query", &service]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if output.status.code() == Some(ERROR_SERVICE_DOES_NOT_EXIST)
            || stdout.contains(&ERROR_SERVICE_DOES_NOT_EXIST.to_string())
        {
            return Ok(None);
        }

        if !output.status.success() {
            return Err(DaemonError::ProcessControl(format!(
                "Failed to query service {}: {}",
                service,
                stdout.trim()
            )));
        }

        parse_sc_state(&stdout).map(Some).ok_or_else(|| {
            DaemonError::ProcessControl(format!("Unexpected sc query output for {}", service))
        })
    }

    async fn register(&self, descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
        let service = Self::service_name(descriptor);
        let bin_path = self.launcher.command_line(descriptor.name());
        let display = format!("{}{}", DISPLAY_PREFIX, descriptor.name());

        self.sc_checked(
            &[
                "create",
                &service,
                "binPath=",
                &bin_path,
                "DisplayName=",
                &display,
                "start=",
                "demand",
            ],
            "register service",
        )
        .await?;

        if let Err(e) = self
            .sc_checked(
                &["description", &service, descriptor.description()],
                "set service description",
            )
            .await
        {
            warn!("{}", e);
        }

        info!("Registered service {}", service);
        Ok(())
    }

    async fn unregister(&self, descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
        let service = Self::service_name(descriptor);
        self.sc_checked(&["delete", &service], "unregister service")
            .await?;
        info!("Unregistered service {}", service);
        Ok(())
    }

    /// Connect to the service manager, or fall back to console events when
    /// this process was not started by it.
    #[cfg(windows)]
    async fn connect_dispatch(&self, descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
        let service = Self::service_name(descriptor);
        let control = self.control.clone();
        let connected = tokio::task::spawn_blocking(move || {
            service::connect(&service, control, DISPATCH_TIMEOUT)
        })
        .await
        .map_err(|e| DaemonError::ProcessControl(format!("Service dispatcher task failed: {}", e)))?;

        match connected {
            Ok(handle) => {
                self.status.attach(handle);
                self.report(ServiceState::Running);
                info!("Connected {} to the service control manager", descriptor.name());
                Ok(())
            }
            Err(e) => {
                warn!(
                    "{} is not running under the service control manager ({}), using console control events",
                    descriptor.name(),
                    e
                );
                self.install_console_dispatch()
            }
        }
    }

    #[cfg(not(windows))]
    async fn connect_dispatch(&self, _descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
        Err(DaemonError::UnsupportedPlatform(
            "service-control dispatch requires Windows".to_string(),
        ))
    }

    #[cfg(windows)]
    fn install_console_dispatch(&self) -> Result<(), DaemonError> {
        use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close, ctrl_shutdown};

        let setup = |e: std::io::Error| DaemonError::SignalSetup(e.to_string());

        let mut shutdown = ctrl_shutdown().map_err(setup)?;
        let cell = self.control.clone();
        tokio::spawn(async move {
            while shutdown.recv().await.is_some() {
                cell.record(ControlMessage::Shutdown);
            }
        });

        let mut close = ctrl_close().map_err(setup)?;
        let cell = self.control.clone();
        tokio::spawn(async move {
            while close.recv().await.is_some() {
                cell.record(ControlMessage::Stop);
            }
        });

        let mut brk = ctrl_break().map_err(setup)?;
        let cell = self.control.clone();
        tokio::spawn(async move {
            while brk.recv().await.is_some() {
                cell.record(ControlMessage::Stop);
            }
        });

        let mut interrupt = ctrl_c().map_err(setup)?;
        let cell = self.control.clone();
        tokio::spawn(async move {
            while interrupt.recv().await.is_some() {
                cell.record(ControlMessage::Stop);
            }
        });

        Ok(())
    }
}

#[async_trait]
impl ProcessController for WindowsController {
    fn family(&self) -> PlatformFamily {
        PlatformFamily::Windows
    }

    async fn daemonize(
        &self,
        descriptor: &DaemonDescriptor,
    ) -> Result<DaemonizeOutcome, DaemonError> {
        self.connect_dispatch(descriptor).await?;
        info!("Service control dispatch installed for {}", descriptor.name());
        Ok(DaemonizeOutcome::Daemon)
    }

    async fn is_running(&self, _descriptor: &DaemonDescriptor) -> Result<bool, DaemonError> {
        match self.control.last() {
            ControlMessage::Stop | ControlMessage::Shutdown => {
                self.report(ServiceState::StopPending);
                Ok(false)
            }
            ControlMessage::Continue
            | ControlMessage::Interrogate
            | ControlMessage::Idle
            | ControlMessage::Other => {
                self.report(ServiceState::Running);
                Ok(true)
            }
        }
    }

    async fn start(&self, descriptor: &DaemonDescriptor) -> Result<Option<u32>, DaemonError> {
        let state = match self.query_state(descriptor).await? {
            Some(state) => Some(state),
            None => {
                self.register(descriptor).await?;
                self.query_state(descriptor).await?
            }
        };

        match state {
            Some(
                ServiceState::Running | ServiceState::StartPending | ServiceState::ContinuePending,
            ) => {
                return Err(DaemonError::ProcessControl(
                    "Daemon already starting/running".to_string(),
                ));
            }
            Some(ServiceState::Paused | ServiceState::PausePending) => {
                return Err(DaemonError::ProcessControl(
                    "Daemon is paused. Please use the resume command".to_string(),
                ));
            }
            _ => {}
        }

        let service = Self::service_name(descriptor);
        self.sc_checked(&["start", &service], "start service")
            .await?;
        info!("Started service {}", service);
        Ok(None)
    }

    async fn stop(&self, descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
        let service = Self::service_name(descriptor);
        if self.query_state(descriptor).await?.is_none() {
            return Err(DaemonError::ProcessControl(format!(
                "Service {} is not registered. Is daemon running?",
                service
            )));
        }

        self.sc_checked(&["stop", &service], "stop service").await?;
        self.unregister(descriptor).await
    }

    async fn die_daemon(&self, _descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
        // The service manager owns the process; it only needs to hear we stopped.
        self.report(ServiceState::Stopped);
        Ok(())
    }

    async fn stop_requested(&self) {
        self.control.stopped().await
    }

    async fn is_alive(&self, descriptor: &DaemonDescriptor) -> Result<bool, DaemonError> {
        Ok(self.query_state(descriptor).await? == Some(ServiceState::Running))
    }

    fn requirements(&self) -> Vec<Requirement> {
        let sc_present = cfg!(windows)
            && std::env::var_os("SystemRoot")
                .map(|root| {
                    std::path::Path::new(&root)
                        .join("System32")
                        .join("sc.exe")
                        .exists()
                })
                .unwrap_or(false);

        vec![
            Requirement::new("sc.exe", "The service control manager client", sc_present),
            Requirement::new(
                "service-dispatcher",
                "Service control dispatcher connection",
                cfg!(windows),
            ),
        ]
    }
}


/// Service control manager plumbing.
#[cfg(windows)]
mod service {
    use std::ffi::OsString;
    use std::sync::mpsc;
    use std::time::Duration;

    use once_cell::sync::OnceCell;
    use parking_lot::Mutex;
    use windows_service::service::{
        ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState as ScmState,
        ServiceStatus, ServiceType,
    };
    use windows_service::service_control_handler::{
        self, ServiceControlHandlerResult, ServiceStatusHandle,
    };
    use windows_service::{define_windows_service, service_dispatcher};

    use super::{ControlCell, ControlMessage, ServiceState};

    type Ready = mpsc::Sender<Result<ServiceStatusHandle, String>>;

    /// Handed from `connect` to `service_main`, which cannot take arguments
    /// of its own.
    struct Pending {
        service: String,
        control: ControlCell,
        ready: Ready,
    }

    static PENDING: OnceCell<Mutex<Option<Pending>>> = OnceCell::new();

    define_windows_service!(ffi_service_main, service_main);

    fn service_main(_arguments: Vec<OsString>) {
        let Some(pending) = PENDING.get().and_then(|slot| slot.lock().take()) else {
            return;
        };
        let control = pending.control.clone();
        let registered = service_control_handler::register(&pending.service, move |event| {
            handle_control(&control, event)
        })
        .map_err(|e| e.to_string());
        let _ = pending.ready.send(registered);
    }

    /// Record a control request for the loop to pick up.
    pub(super) fn handle_control(
        cell: &ControlCell,
        event: ServiceControl,
    ) -> ServiceControlHandlerResult {
        let message = match event {
            ServiceControl::Stop => ControlMessage::Stop,
            ServiceControl::Shutdown => ControlMessage::Shutdown,
            ServiceControl::Continue => ControlMessage::Continue,
            ServiceControl::Interrogate => ControlMessage::Interrogate,
            _ => return ServiceControlHandlerResult::NotImplemented,
        };
        cell.record(message);
        ServiceControlHandlerResult::NoError
    }

    /// Start the dispatcher thread and wait for the control handler.
    ///
    /// Fails fast when the process was not launched by the service manager.
    pub(super) fn connect(
        service: &str,
        control: ControlCell,
        timeout: Duration,
    ) -> Result<ServiceStatusHandle, String> {
        let (ready, handles) = mpsc::channel();
        let slot = PENDING.get_or_init(|| Mutex::new(None));
        *slot.lock() = Some(Pending {
            service: service.to_string(),
            control,
            ready: ready.clone(),
        });

        let name = service.to_string();
        std::thread::Builder::new()
            .name("service-dispatcher".to_string())
            .spawn(move || {
                if let Err(e) = service_dispatcher::start(&name, ffi_service_main) {
                    let _ = ready.send(Err(e.to_string()));
                }
            })
            .map_err(|e| e.to_string())?;

        handles.recv_timeout(timeout).map_err(|e| e.to_string())?
    }

    pub(super) fn status(state: ServiceState) -> ServiceStatus {
        let current_state = match state {
            ServiceState::Stopped => ScmState::Stopped,
            ServiceState::StartPending => ScmState::StartPending,
            ServiceState::StopPending => ScmState::StopPending,
            ServiceState::Running => ScmState::Running,
            ServiceState::ContinuePending => ScmState::ContinuePending,
            ServiceState::PausePending => ScmState::PausePending,
            ServiceState::Paused => ScmState::Paused,
        };
        let controls_accepted = match state {
            ServiceState::Running => ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN,
            _ => ServiceControlAccept::empty(),
        };
        ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state,
            controls_accepted,
            exit_code: ServiceExitCode::Win32(0),
            checkpoint: 0,
            wait_hint: Duration::default(),
            process_id: None,
        }
    }
}
