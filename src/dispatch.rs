//! The dispatch loop.
//!
//! Before every step the loop compares the instruction pointer against the hook table. On a hit the handler runs
//! instead of the instruction at that address, and the returned [`Continuation`] decides what happens next.
//! Everything else is left to the engine's step primitive.
//!
//! A hook is only ever reached through a call that pushed a return address and the caller's stack pointer, so on
//! [`Continuation::Resume`] the dispatcher returns to stack slot 0 with the stack pointer from slot 1.

use std::io::{self, Stdout, Write};

use log::{debug, error, info, trace};

use crate::abi::Abi;
use crate::arch::{Profile, Role};
use crate::config::HookConfig;
use crate::engine::{Engine, Step};
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::hooks::{self, default_hooks, Continuation, HookCtx, HookKind, HookTable, PatchReport, Registration};
use crate::image::ImageInfo;

/// Why [`Dispatcher::run`] stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exit {
    /// A handler ended the session. `status` is the value it returned, if any.
    Terminated { status: Option<u64>, steps: u64 },
    /// Execution reached an invalid hook, or a handler asked to fault.
    Fault { address: u64, steps: u64 },
    StepLimit { steps: u64 },
}

pub struct Dispatcher<E: Engine, W: Write = Stdout> {
    profile: &'static Profile,
    table: HookTable<E>,
    heap: Heap,
    config: HookConfig,
    out: W,
    exit_status: Option<u64>,
}

impl<E: Engine> Dispatcher<E> {
    pub fn new(profile: &'static Profile, config: HookConfig) -> Result<Self> {
        Self::with_output(profile, config, io::stdout())
    }
}

impl<E: Engine, W: Write> Dispatcher<E, W> {
    /// Uses the default hooks, plus an invalid entry for every name in [`HookConfig::unbound`].
    pub fn with_output(profile: &'static Profile, config: HookConfig, out: W) -> Result<Self> {
        let registrations = default_hooks()
            .into_iter()
            .chain(config.unbound.iter().map(Registration::invalid))
            .collect::<Vec<_>>();
        Self::with_hooks(profile, config, registrations, out)
    }

    pub fn with_hooks(
        profile: &'static Profile, config: HookConfig, registrations: impl IntoIterator<Item = Registration<E>>, out: W,
    ) -> Result<Self> {
        let table = HookTable::build(config.layout.hook_base, profile.word, registrations)?;
        config.layout.validate(table.range(), &[])?;
        info!(
            "Hook table for {}: {} entries at 0x{:X}..0x{:X}",
            profile.arch,
            table.len(),
            table.range().start,
            table.range().end
        );

        Ok(Dispatcher {
            profile,
            heap: Heap::new(config.layout.heap()?),
            table,
            config,
            out,
            exit_status: None,
        })
    }

    pub fn profile(&self) -> &'static Profile {
        self.profile
    }

    pub fn table(&self) -> &HookTable<E> {
        &self.table
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Status passed to the last terminating hook.
    pub fn exit_status(&self) -> Option<u64> {
        self.exit_status
    }

    /// Every address the dispatcher intercepts. Engines that report execution through callbacks rather than a step
    /// loop can register these and forward hits to [`Dispatcher::intercept`].
    pub fn hook_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.table.addresses()
    }

    /// Checks the layout against the image and redirects the image's imports to the hook table.
    pub fn install(&self, engine: &mut E, image: &ImageInfo) -> Result<PatchReport> {
        if image.arch != self.profile.arch {
            return Err(Error::ArchMismatch {
                profile: self.profile.arch,
                engine: image.arch,
            });
        }

        self.config.layout.validate(self.table.range(), &image.mapped_ranges())?;
        hooks::install(engine, self.profile, &self.table, image)
    }

    /// Runs the hook at `pc`, if there is one, and applies its continuation.
    ///
    /// Returns `None` when `pc` is not a hook address. Reaching an invalid entry yields [`Continuation::Fault`]
    /// without touching any engine state.
    pub fn intercept(&mut self, engine: &mut E, pc: u64) -> Result<Option<Continuation>> {
        let Some(entry) = self.table.by_addr(pc) else {
            return Ok(None)
        };

        let handler = match (entry.kind, entry.handler) {
            (HookKind::Invalid, _) | (_, None) => {
                error!("{} ({})", Error::InvalidHookReached { address: pc }, entry.name);
                return Ok(Some(Continuation::Fault))
            },
            (_, Some(handler)) => handler,
        };

        debug!("Executing hook {} at 0x{pc:X}", entry.name);
        let result = {
            let mut ctx = HookCtx {
                abi: Abi::new(engine, self.profile)?,
                heap: &mut self.heap,
                config: &self.config,
                out: &mut self.out,
                name: &entry.name,
            };
            handler(&mut ctx)?
        };

        match result.continuation {
            Continuation::Resume => {
                let mut abi = Abi::new(engine, self.profile)?;
                let return_addr = abi.stack_slot(0)?;
                let saved_sp = abi.stack_slot(1)?;

                if let Some(value) = result.value {
                    abi.set_role(Role::Ret, value)?;
                }

                if let Some(expr) = result.symbolic {
                    let ret = self.profile.role(Role::Ret)?;
                    abi.engine_mut().assign_register_expr(ret, expr);
                }

                abi.set_role(Role::Ip, return_addr)?;
                abi.set_role(Role::Sp, saved_sp)?;
                trace!("{} returns to 0x{return_addr:X} (sp=0x{saved_sp:X})", entry.name);
            },
            Continuation::ResumeAtRegisterIP => (),
            Continuation::Terminate => self.exit_status = result.value,
            Continuation::Fault => error!("Hook {} at 0x{pc:X} faulted", entry.name),
        }

        Ok(Some(result.continuation))
    }

    /// Steps the engine until a hook terminates or faults, or `max_steps` steps have run.
    ///
    /// Both instructions and hook invocations count as steps. Errors from the engine or a handler halt the loop and
    /// are returned as-is.
    pub fn run<S: Step<E>>(&mut self, engine: &mut E, stepper: &mut S, max_steps: Option<u64>) -> Result<Exit> {
        let ip = self.profile.role(Role::Ip)?;
        let mut steps = 0;
        loop {
            if max_steps.is_some_and(|max| steps >= max) {
                info!("Step limit reached after {steps} step(s)");
                return Ok(Exit::StepLimit {
                    steps,
                })
            }

            let pc = engine.register(ip);
            let result = match self.intercept(engine, pc) {
                Ok(None) => stepper.step(engine).map(|()| None),
                other => other,
            };

            match result {
                Ok(Some(Continuation::Terminate)) => {
                    info!("Terminated at 0x{pc:X} after {steps} step(s), status {:?}", self.exit_status);
                    return Ok(Exit::Terminated {
                        status: self.exit_status,
                        steps,
                    })
                },
                Ok(Some(Continuation::Fault)) => {
                    return Ok(Exit::Fault {
                        address: pc,
                        steps,
                    })
                },
                Ok(_) => steps += 1,
                Err(e) => {
                    error!("Execution halted at 0x{pc:X} after {steps} step(s): {e}");
                    return Err(e)
                },
            }
        }
    }
}
