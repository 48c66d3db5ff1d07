//! System assembly and scheduling
//!
//! Ownership follows the threads. A [`System`] owns the extended memory
//! and the shutdown flag. Each [`Mainframe`] owns its central memory,
//! PPU barrel, channels, devices and CPU 0, and is moved into the thread
//! that runs its major-cycle loop:
//!
//!   operator poll -> step all PPUs -> step CPU `cpu_ratio` times ->
//!   step all channels -> tick the clock
//!
//! CPU 1, when configured, lives on its own thread and steps only
//! itself; it is woken by a condition variable at the start of each CPU
//! phase and touches nothing but central memory and the exchange gate.
//! With two mainframes, one system-wide lock serialises the PPU and
//! channel phases so shared extended-memory traffic has a total order;
//! the single-mainframe path never takes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info};
use thiserror::Error;

use crate::channel::{
    init_channels, Channel, CH_CLOCK, CH_INTERLOCK, CH_MAINTENANCE, CH_STATUS_CONTROL,
};
use crate::clock::{Rtc, RtcDevice};
use crate::config::{Features, SystemConfig};
use crate::cpu::{Cpu, ExchangeGate};
use crate::device::DeviceKind;
use crate::devices::console::Console;
use crate::devices::cr405::Cr405;
use crate::devices::hardwired::{InterlockRegister, MaintenanceChannel, StatusControlRegister};
use crate::devices::lp501::Lp501;
use crate::devices::mt669::Mt669;
use crate::devices::DeviceError;
use crate::extended::{ExtendedMemory, ExtendedMemoryError};
use crate::memory::CentralMemory;
use crate::npu::hip::NpuHip;
use crate::npu::Npu;
use crate::ppu::{step_all, Ppu, PpuEnv};

#[derive(Debug, Error)]
pub enum SystemError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    ExtendedMemory(#[from] ExtendedMemoryError),
    #[error("npu listener: {0}")]
    NpuListener(std::io::Error),
}

/// Rendezvous waking the second CPU's thread each cycle.
pub struct CpuRun {
    cycle: Mutex<u64>,
    cv: Condvar,
}

impl CpuRun {
    fn new() -> Arc<CpuRun> {
        Arc::new(CpuRun {
            cycle: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    /// Primary thread: announce the CPU phase of a new cycle.
    pub fn signal(&self) {
        let mut cycle = self.cycle.lock().expect("cpu run lock");
        *cycle += 1;
        self.cv.notify_one();
    }

    /// Second CPU thread: wait for the next cycle, bounded so shutdown
    /// is never missed.
    pub fn wait(&self, seen: &mut u64) {
        let cycle = self.cycle.lock().expect("cpu run lock");
        let (cycle, _) = self
            .cv
            .wait_timeout_while(cycle, Duration::from_millis(1), |c| *c == *seen)
            .expect("cpu run wait");
        *seen = *cycle;
    }
}

/// One mainframe: everything its scheduler thread owns.
pub struct Mainframe {
    pub id: u8,
    pub cm: Arc<CentralMemory>,
    pub ecs: Arc<ExtendedMemory>,
    pub gate: Arc<ExchangeGate>,
    pub rtc: Arc<Rtc>,
    pub cpu_run: Arc<CpuRun>,
    pub ppus: Vec<Ppu>,
    pub channels: Vec<Channel>,
    pub cpu0: Cpu,
    /// The second CPU until its thread claims it.
    pub cpu1: Option<Cpu>,
    pub npu: Option<Arc<Mutex<Npu>>>,
    features: Features,
    cpu_ratio: u32,
    cpus: usize,
    deadstart_panel: Vec<u16>,
}

impl Mainframe {
    /// Build a mainframe from the profile: memory, processors, channels,
    /// hardwired devices, configured equipment.
    pub fn new(
        id: u8,
        config: &SystemConfig,
        ecs: Arc<ExtendedMemory>,
    ) -> Result<Mainframe, SystemError> {
        let features = config.features;
        let cm = Arc::new(CentralMemory::new(config.memory));
        let gate = ExchangeGate::new();
        let rtc = Rtc::new(config.clock_increment);

        let cpu0 = Cpu::new(
            0,
            features,
            Arc::clone(&cm),
            Arc::clone(&ecs),
            Arc::clone(&gate),
        );
        let cpu1 = (config.cpus > 1).then(|| {
            Cpu::new(
                1,
                features,
                Arc::clone(&cm),
                Arc::clone(&ecs),
                Arc::clone(&gate),
            )
        });

        let ppus = (0..config.pps).map(|n| Ppu::new(n, features)).collect();
        let mut channels = init_channels(config.channel_count());

        // Hardwired channels. The clock is always there; the rest follow
        // the model's feature word.
        let rtc_device = RtcDevice::new(Arc::clone(&rtc), features);
        rtc_device.prime_channel(&mut channels[CH_CLOCK as usize].state);
        channels[CH_CLOCK as usize].attach(Box::new(rtc_device), true);

        if features.intersects(Features::INTERLOCK_REG | Features::TWO_PORT_MUX) {
            channels[CH_INTERLOCK as usize].attach(Box::new(InterlockRegister::new()), true);
        }
        if features.contains(Features::STATUS_CONTROL_REG) {
            channels[CH_STATUS_CONTROL as usize]
                .attach(Box::new(StatusControlRegister::new()), true);
        }
        if features.contains(Features::MAINTENANCE_CHANNEL) {
            channels[CH_MAINTENANCE as usize].attach(Box::new(MaintenanceChannel), true);
        }

        let mut mainframe = Mainframe {
            id,
            cm,
            ecs,
            gate,
            rtc,
            cpu_run: CpuRun::new(),
            ppus,
            channels,
            cpu0,
            cpu1,
            npu: None,
            features,
            cpu_ratio: config.cpu_ratio,
            cpus: config.cpus as usize,
            deadstart_panel: config.deadstart.clone(),
        };
        mainframe.attach_equipment(config)?;
        Ok(mainframe)
    }

    /// Instantiate the equipment section.
    fn attach_equipment(&mut self, config: &SystemConfig) -> Result<(), SystemError> {
        for entry in &config.equipment {
            let channel = entry.channel_no as usize;
            if self.channels[channel].state.hardwired {
                // The profile parser bounds the channel number; hardwired
                // channels cannot be reassigned.
                continue;
            }

            match entry.kind {
                DeviceKind::Console => {
                    self.channels[channel].attach(Box::new(Console::new()), false);
                }
                DeviceKind::Mt669 => {
                    let mut tape = Mt669::new(entry.eq_no);
                    if let Some(name) = &entry.device_name {
                        tape.load_unit(entry.unit_no, std::path::Path::new(name), true)?;
                    }
                    self.channels[channel].attach(Box::new(tape), false);
                }
                DeviceKind::Cr405 => {
                    let mut reader = Cr405::new(entry.eq_no);
                    if let Some(name) = &entry.device_name {
                        reader.load_deck(std::path::Path::new(name))?;
                    }
                    self.channels[channel].attach(Box::new(reader), false);
                }
                DeviceKind::Lp501 | DeviceKind::Lp512 => {
                    let default_name = format!("LP{:02o}_C{:02o}.txt", entry.eq_no, channel);
                    let name = entry.device_name.clone().unwrap_or(default_name);
                    let printer =
                        Lp501::new(entry.eq_no, entry.kind, std::path::Path::new(&name))?;
                    self.channels[channel].attach(Box::new(printer), false);
                }
                DeviceKind::Npu => {
                    // Without an npuConnections section, fall back to the
                    // classic raw port (offset per mainframe).
                    let npu = if config.npu_connections.is_empty() {
                        Npu::with_default_port(6610 + self.id as u16)
                    } else {
                        Npu::new(&config.npu_connections)
                    };
                    let npu = Arc::new(Mutex::new(npu));
                    self.channels[channel]
                        .attach(Box::new(NpuHip::new(Arc::clone(&npu))), false);
                    self.npu = Some(npu);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Deadstart: clear the machine and load the panel program into
    /// PPU 0. The CPUs stay stopped until the bootstrap issues its
    /// monitor exchange.
    pub fn deadstart(&mut self) {
        self.cpu0.reset();
        if let Some(cpu1) = &mut self.cpu1 {
            cpu1.reset();
        }
        for ppu in &mut self.ppus {
            ppu.reset();
        }

        for (addr, &word) in self.deadstart_panel.iter().enumerate() {
            self.ppus[0].mem[addr] = word;
        }
        self.ppus[0].p = 0;

        info!(
            "mainframe {}: deadstart, {} panel words",
            self.id,
            self.deadstart_panel.len()
        );
    }

    /// One major cycle: PPUs, CPU 0, channels, clock. The second CPU is
    /// woken at the start of the CPU phase and runs concurrently against
    /// central memory only.
    pub fn cycle(&mut self) {
        {
            let mut env = PpuEnv {
                channels: &mut self.channels,
                cm: &self.cm,
                ecs: &self.ecs,
                gate: &self.gate,
                cpus: self.cpus,
            };
            step_all(&mut self.ppus, &mut env);
        }

        if self.cpus > 1 {
            self.cpu_run.signal();
        }
        for _ in 0..self.cpu_ratio {
            if self.cpu0.step() {
                break;
            }
        }

        for channel in &mut self.channels {
            channel.step();
        }
        if let Some(npu) = &self.npu {
            npu.lock().expect("npu lock").net_check_status();
        }

        self.rtc.tick();
    }

    /// Model feature word, for the front-end.
    pub fn features(&self) -> Features {
        self.features
    }

    // ========== Operator requests ==========
    //
    // The interactive interpreter lives in the front-end; these are the
    // core-side handlers it calls.

    /// Operator: mount a tape image.
    pub fn load_tape(
        &mut self,
        channel: u8,
        unit: u8,
        path: &std::path::Path,
        write_enabled: bool,
    ) -> Result<(), DeviceError> {
        if let Some(device) = self
            .channels
            .get_mut(channel as usize)
            .and_then(|c| c.device.as_mut())
        {
            if let Some(tape) = device.as_any_mut().downcast_mut::<Mt669>() {
                return tape.load_unit(unit, path, write_enabled);
            }
        }
        Err(DeviceError::NoSuchDevice { channel })
    }

    /// Operator: dismount a tape image.
    pub fn unload_tape(&mut self, channel: u8, unit: u8) -> Result<(), DeviceError> {
        if let Some(device) = self
            .channels
            .get_mut(channel as usize)
            .and_then(|c| c.device.as_mut())
        {
            if let Some(tape) = device.as_any_mut().downcast_mut::<Mt669>() {
                return tape.unload_unit(unit);
            }
        }
        Err(DeviceError::NoSuchDevice { channel })
    }

    /// Operator: remove paper from the printer on a channel, truncating
    /// its output file.
    pub fn remove_paper(&mut self, channel: u8) -> Result<(), DeviceError> {
        if let Some(device) = self
            .channels
            .get_mut(channel as usize)
            .and_then(|c| c.device.as_mut())
        {
            if let Some(printer) = device.as_any_mut().downcast_mut::<Lp501>() {
                return printer.remove_paper();
            }
        }
        Err(DeviceError::NoSuchDevice { channel })
    }
}

/// The whole emulated installation.
pub struct System {
    pub config: SystemConfig,
    pub ecs: Arc<ExtendedMemory>,
    active: Arc<AtomicBool>,
    /// Serialises PPU/channel phases across mainframes; only ever locked
    /// when two mainframes are configured.
    sys_pp_lock: Arc<Mutex<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl System {
    /// Build the system: extended memory (with optional persistence) and
    /// the configuration. Mainframes are built by [`System::start`].
    pub fn new(config: SystemConfig) -> Result<System, SystemError> {
        let mut ecs = ExtendedMemory::new(config.ecs_banks, config.esm_banks);
        if let Some(dir) = &config.persist_dir {
            ecs.attach_backing(dir)?;
        }
        Ok(System {
            config,
            ecs: Arc::new(ecs),
            active: Arc::new(AtomicBool::new(true)),
            sys_pp_lock: Arc::new(Mutex::new(())),
            threads: Vec::new(),
        })
    }

    /// The process-wide run flag. Cleared by [`System::shutdown`];
    /// every thread exits at its next loop head.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Build a mainframe against this system's extended memory.
    pub fn build_mainframe(&self, id: u8) -> Result<Mainframe, SystemError> {
        Mainframe::new(id, &self.config, Arc::clone(&self.ecs))
    }

    /// Deadstart every configured mainframe and start the threads.
    pub fn start(&mut self) -> Result<(), SystemError> {
        let multi = self.config.mainframes > 1;

        for id in 0..self.config.mainframes {
            let mut mainframe = self.build_mainframe(id)?;
            mainframe.deadstart();

            if let Some(npu) = &mainframe.npu {
                npu.lock()
                    .expect("npu lock")
                    .net
                    .start_listeners(self.active_flag())
                    .map_err(SystemError::NpuListener)?;
            }

            // The second CPU moves to its own thread before the
            // mainframe moves to the scheduler thread.
            if let Some(mut cpu1) = mainframe.cpu1.take() {
                let active = self.active_flag();
                let cpu_run = Arc::clone(&mainframe.cpu_run);
                let ratio = self.config.cpu_ratio;
                let handle = thread::Builder::new()
                    .name(format!("cpu1-mf{}", id))
                    .spawn(move || {
                        let mut seen = 0u64;
                        while active.load(Ordering::Relaxed) {
                            cpu_run.wait(&mut seen);
                            for _ in 0..ratio {
                                if cpu1.step() {
                                    break;
                                }
                            }
                        }
                    })
                    .expect("spawn cpu1 thread");
                self.threads.push(handle);
            }

            let active = self.active_flag();
            let sys_lock = multi.then(|| Arc::clone(&self.sys_pp_lock));
            let handle = thread::Builder::new()
                .name(format!("cpu0-mf{}", id))
                .spawn(move || {
                    while active.load(Ordering::Relaxed) {
                        match &sys_lock {
                            Some(lock) => {
                                let _guard = lock.lock().expect("system pp lock");
                                mainframe.cycle();
                            }
                            None => mainframe.cycle(),
                        }
                    }
                })
                .expect("spawn mainframe thread");
            self.threads.push(handle);
        }

        info!(
            "running with {} mainframe(s), {} CPU(s) each",
            self.config.mainframes, self.config.cpus
        );
        Ok(())
    }

    /// Request shutdown: threads observe the flag at their next loop
    /// head.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    /// Join all threads and flush persistent state.
    pub fn terminate(&mut self) {
        self.shutdown();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if let Err(e) = self.ecs.save() {
            error!("failed to save extended memory: {}", e);
        }
        info!("emulation terminated");
    }
}

impl Drop for System {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.terminate();
        }
    }
}

/// A minimal deadstart program assembled from PPU opcodes: request a CPU
/// exchange at the given package address, then idle PPU 0. Front-ends
/// can use it to synthesise a panel when the profile has none to hand.
pub fn exchange_bootstrap(package_addr: u16) -> Vec<u16> {
    vec![
        0o2000 | ((package_addr >> 12) & 0o77),       // LDC package address
        package_addr & 0o7777,
        0o2600,                                       // EXN
        0o0300,                                       // UJN 0: idle loop
    ]
}
