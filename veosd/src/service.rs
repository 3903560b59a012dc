//! Wires the DMA engine, the memory-transfer facade, and the signal
//! subsystem's registry/background threads into one running service
//! object, grounded in the same "build it once in `main`, hand `Arc`s to
//! worker threads" wiring the request-handling worker pool uses.

use std::sync::Arc;

use ve_dma::driver::SimDriver;
use ve_dma::{DmaEngine, PageTranslator, N_DESC};
use ve_mem::backend::{DmaBackend, MemoryBackend};
use ve_mem::image::VeMemoryImage;
use ve_signal::coredump::{CoreDumpConfig, ElfDumper, HelperLauncher, NullElfDumper, RealHelperLauncher};
use ve_task::polling::{DeadPidSource, NullDeadPidSource, PollingThread, RealDeadPidSource};
use ve_task::registry::{ProcStatusSource, RealProcStatusSource, Registry};
use ve_task::stopping::StoppingThread;

use crate::config::Config;

/// No host/VE page tables are reachable from this process, so every
/// virtual address resolves to itself; a production build replaces this
/// with the real translation ioctl against the driver device.
struct IdentityTranslator;

impl PageTranslator for IdentityTranslator {
    fn translate(&self, _pid: i32, addr: u64) -> Result<u64, ve_dma::Error> {
        Ok(addr)
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid, appropriately sized local buffer.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Everything a connection handler needs to serve one request, bundled
/// so `server.rs` only has to thread a single `Arc<Service>` through.
pub struct Service {
    pub registry: Arc<Registry>,
    pub engine: DmaEngine,
    pub translator: Arc<dyn PageTranslator>,
    pub mem: Arc<dyn MemoryBackend>,
    pub proc_status: Arc<dyn ProcStatusSource>,
    pub polling: Arc<PollingThread>,
    pub stopping: Arc<StoppingThread>,
    pub core_dump_config: Arc<CoreDumpConfig>,
    pub helper_launcher: Arc<dyn HelperLauncher>,
    pub elf_dumper: Arc<dyn ElfDumper>,
}

impl Service {
    pub fn new(config: &Config) -> std::io::Result<Arc<Self>> {
        log::info!("opening dma engine for {}", config.driver_device_path());
        let driver = Arc::new(SimDriver::new(N_DESC));
        let engine =
            DmaEngine::open(driver).map_err(|e| std::io::Error::other(format!("dma engine open failed: {e}")))?;

        let translator: Arc<dyn PageTranslator> = Arc::new(IdentityTranslator);
        let image = Arc::new(VeMemoryImage::new());
        let host_pid = std::process::id() as i32;
        let mem: Arc<dyn MemoryBackend> =
            Arc::new(DmaBackend::new(engine.clone(), translator.clone(), host_pid, image));

        let registry = Arc::new(Registry::new());
        let proc_status: Arc<dyn ProcStatusSource> = Arc::new(RealProcStatusSource);
        let dead_pid_source: Arc<dyn DeadPidSource> = match RealDeadPidSource::open(&config.dead_pid_attr_path()) {
            Ok(src) => Arc::new(src),
            Err(e) => {
                log::warn!(
                    "dead-pid attribute {} unavailable ({e}); polling thread will never reap orphans",
                    config.dead_pid_attr_path()
                );
                Arc::new(NullDeadPidSource)
            }
        };

        let polling = PollingThread::new(registry.clone(), dead_pid_source);
        polling.spawn();
        let stopping = StoppingThread::new(registry.clone(), proc_status.clone());
        stopping.spawn();

        let core_pattern = std::fs::read_to_string(&config.core_pattern_file)
            .unwrap_or_else(|_| "core".to_string())
            .trim()
            .to_string();

        let core_dump_config = Arc::new(CoreDumpConfig {
            core_pattern,
            ve_exec_dir: std::env::temp_dir().to_string_lossy().into_owned(),
            hostname: hostname(),
            helper_path: config.core_helper.clone(),
        });

        Ok(Arc::new(Self {
            registry,
            engine,
            translator,
            mem,
            proc_status,
            polling,
            stopping,
            core_dump_config,
            helper_launcher: Arc::new(RealHelperLauncher),
            elf_dumper: Arc::new(NullElfDumper::new()),
        }))
    }

    /// Registers the pseudo process `pid` (its own thread-group leader)
    /// with the registry if this is the first time it's been seen,
    /// mirroring the reference's implicit task creation on first contact.
    pub fn ensure_task(&self, pid: i32, config: &Config) -> Arc<ve_task::task::VeTask> {
        if let Some(task) = self.registry.lookup(pid) {
            return task;
        }
        let sighand = self.registry.sighand_for_group(pid, config.rlimit_core, config.rlimit_sigpending);
        let task = ve_task::task::VeTask::new(pid, pid, 0, 0, sighand);
        self.registry.insert(task.clone());
        task
    }

    /// Halts the DMA engine and joins every background thread. Called
    /// once the accept loop has returned after `terminate_flag` is set.
    pub fn shutdown(&self) {
        self.registry.terminate_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        self.engine.terminate_all();
        let _ = self.engine.close();
        self.polling.join();
        self.stopping.join();
    }
}
