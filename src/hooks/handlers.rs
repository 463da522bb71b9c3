//! The stubbed library functions.
//!
//! These approximate the libc behaviour a typical crackme or CTF target relies on. Output goes to the dispatcher's
//! host writer, one line per call.

use std::io::Write;

use log::{debug, info, warn};

use crate::arch::Role;
use crate::config::{InputLength, StrlenPolicy};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::hooks::{Continuation, HookCtx, HookResult, Registration};

/// First stack slot of the synthesized argument vector. Slots 0 and 1 hold the return address and the saved stack
/// pointer, slot 2 is left alone.
pub const ARGV_SLOT: u64 = 3;

pub fn default_hooks<E: Engine>() -> Vec<Registration<E>> {
    vec![
        Registration::entry("__libc_start_main", libc_start_main),
        Registration::stub("printf", printf),
        Registration::stub("puts", puts),
        Registration::stub("fflush", fflush),
        Registration::stub("getlogin", getlogin),
        Registration::stub("usleep", usleep),
        Registration::stub("sleep", sleep),
        Registration::stub("putchar", putchar),
        Registration::stub("exit", exit),
        Registration::stub("strlen", strlen),
        Registration::stub("fgets", fgets),
    ]
}

/// Reads the NUL-terminated string at `addr`. Gives up after `max_string_len` bytes and returns what it has.
fn read_cstr<E: Engine>(ctx: &HookCtx<'_, E>, addr: u64) -> Result<Vec<u8>> {
    let window = ctx.config.max_string_len;
    let engine = ctx.abi.engine();
    let mut data = Vec::new();
    let mut b = [0u8; 1];
    for offset in 0..window {
        engine.read_memory(addr.wrapping_add(offset), &mut b)?;
        if b[0] == 0 {
            return Ok(data)
        }

        data.push(b[0]);
    }

    warn!(
        "{}: {}",
        ctx.name,
        Error::UnterminatedString {
            address: addr,
            window
        }
    );
    Ok(data)
}

fn emit_line<E: Engine>(ctx: &mut HookCtx<'_, E>, text: &[u8]) -> Result<()> {
    ctx.out.write_all(text)?;
    ctx.out.write_all(b"\n")?;
    Ok(())
}

fn count_conversions(format: &[u8]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i < format.len() {
        if format[i] == b'%' {
            if format.get(i + 1) == Some(&b'%') {
                i += 2;
                continue
            }

            count += 1;
        }

        i += 1;
    }

    count
}

fn libc_start_main<E: Engine>(ctx: &mut HookCtx<'_, E>) -> Result<HookResult<E::Expr>> {
    let main = ctx.arg(0)?;
    let config = ctx.config;

    for (i, arg) in config.argv.iter().enumerate() {
        let ptr = ctx.alloc_cstr(arg)?;
        ctx.abi.set_stack_slot(ARGV_SLOT + i as u64, ptr)?;
    }

    let argc = config.argv.len() as u64;
    ctx.abi.set_stack_slot(ARGV_SLOT + argc, 0)?;
    let argv = ctx.abi.stack_slot_addr(ARGV_SLOT)?;

    ctx.abi.set_arg(0, argc)?;
    ctx.abi.set_arg(1, argv)?;
    ctx.abi.set_arg(2, 0)?;
    ctx.abi.set_role(Role::Ip, main)?;

    info!("Entering main at 0x{main:X} (argc={argc}, argv=0x{argv:X})");
    Ok(HookResult::redirected())
}

// TODO: expand conversions with the variadic arguments instead of printing the raw format.
fn printf<E: Engine>(ctx: &mut HookCtx<'_, E>) -> Result<HookResult<E::Expr>> {
    let format = ctx.arg(0)?;
    let text = read_cstr(ctx, format)?;
    debug!("printf: {} conversion(s) in format", count_conversions(&text));

    emit_line(ctx, &text)?;
    Ok(HookResult::resume(0))
}

fn puts<E: Engine>(ctx: &mut HookCtx<'_, E>) -> Result<HookResult<E::Expr>> {
    let s = ctx.arg(0)?;
    let text = read_cstr(ctx, s)?;

    emit_line(ctx, &text)?;
    Ok(HookResult::resume(0))
}

fn fflush<E: Engine>(ctx: &mut HookCtx<'_, E>) -> Result<HookResult<E::Expr>> {
    debug!("fflush(0x{:X})", ctx.arg(0)?);
    Ok(HookResult::resume(0))
}

fn getlogin<E: Engine>(ctx: &mut HookCtx<'_, E>) -> Result<HookResult<E::Expr>> {
    let config = ctx.config;
    let user = ctx.alloc_cstr(&config.login)?;

    debug!("getlogin() = {:?} at 0x{user:X}", config.login);
    Ok(HookResult::resume(user))
}

fn usleep<E: Engine>(ctx: &mut HookCtx<'_, E>) -> Result<HookResult<E::Expr>> {
    info!("usleep: skipping {} us", ctx.arg(0)?);
    Ok(HookResult::resume(0))
}

fn sleep<E: Engine>(ctx: &mut HookCtx<'_, E>) -> Result<HookResult<E::Expr>> {
    info!("sleep: skipping {} s", ctx.arg(0)?);
    Ok(HookResult::resume(0))
}

fn putchar<E: Engine>(ctx: &mut HookCtx<'_, E>) -> Result<HookResult<E::Expr>> {
    let c = ctx.arg(0)?;
    ctx.out.write_all(&[c as u8])?;
    Ok(HookResult::resume(c))
}

fn exit<E: Engine>(ctx: &mut HookCtx<'_, E>) -> Result<HookResult<E::Expr>> {
    let code = ctx.arg(0)?;
    info!("exit({code})");
    Ok(HookResult::terminate(code))
}

/// Length of the string at `arg(0)`.
///
/// The scan runs up to the first byte that is zero and not symbolic. If any byte before it is symbolic, the result
/// also carries a symbolic length: `ite(b[0] == 0, 0, ite(b[1] == 0, 1, ... end))` over the symbolic bytes, so the
/// lowest index that turns out to be zero wins. The concrete length is the first index whose current concrete value
/// is zero.
fn strlen<E: Engine>(ctx: &mut HookCtx<'_, E>) -> Result<HookResult<E::Expr>> {
    let addr = ctx.arg(0)?;
    let window = ctx.config.max_string_len;
    let engine = ctx.abi.engine();

    let mut terminator = None;
    let mut concrete = None;
    let mut any_symbolic = false;
    let mut b = [0u8; 1];
    for i in 0..window {
        let a = addr.wrapping_add(i);
        engine.read_memory(a, &mut b)?;
        if b[0] == 0 && concrete.is_none() {
            concrete = Some(i);
        }

        if engine.is_symbolic(a) {
            any_symbolic = true;
        } else if b[0] == 0 {
            terminator = Some(i);
            break
        }
    }

    let end = terminator.unwrap_or_else(|| {
        warn!(
            "{}: {}",
            ctx.name,
            Error::UnterminatedString {
                address: addr,
                window
            }
        );
        window
    });
    let concrete = concrete.unwrap_or(end);

    if !any_symbolic {
        debug!("strlen(0x{addr:X}) = {concrete}");
        return Ok(HookResult::resume(concrete))
    }

    let bits = ctx.abi.profile().word_bits();
    let mut expr = engine.bv(end, bits);
    for i in (0..end).rev() {
        let Some(byte) = engine.memory_expr(addr.wrapping_add(i)) else {
            continue
        };

        expr = engine.ite(engine.equal(byte, engine.bv(0, 8)), engine.bv(i, bits), expr);
    }

    debug!("strlen(0x{addr:X}) = {concrete}, symbolic up to {end}");
    let result = match ctx.config.strlen {
        StrlenPolicy::ConcreteAndSymbolic => HookResult::resume(concrete),
        StrlenPolicy::SymbolicOnly => HookResult {
            value: None,
            symbolic: None,
            continuation: Continuation::Resume,
        },
    };

    Ok(result.with_symbolic(expr))
}

/// Marks the destination buffer as program input: every byte becomes a fresh symbolic variable.
fn fgets<E: Engine>(ctx: &mut HookCtx<'_, E>) -> Result<HookResult<E::Expr>> {
    let buf = ctx.arg(0)?;
    let policy = ctx.config.input;
    let mut len = match policy.length {
        InputLength::Argument => ctx.arg(1)?,
        InputLength::Fixed(n) => n,
    };

    if len > ctx.config.max_string_len {
        warn!("fgets: clamping length 0x{len:X} to 0x{:X}", ctx.config.max_string_len);
        len = ctx.config.max_string_len;
    }

    let name = ctx.name;
    let engine = ctx.abi.engine_mut();
    for offset in 0..len {
        let var = engine.symbolize_memory(buf.wrapping_add(offset), &format!("{name}_{offset}"))?;
        if policy.printable {
            let lower = engine.bvuge(var.clone(), engine.bv(0x20, 8));
            let upper = engine.bvult(var, engine.bv(0x7F, 8));
            let printable = engine.land(lower, upper);
            engine.add_constraint(printable);
        }
    }

    info!("fgets: symbolized 0x{buf:X}..0x{:X}", buf.wrapping_add(len));
    Ok(HookResult::resume(0))
}
