//! Child-side runner - what a forked child executes.
//!
//! The parent side (spawning, reading, reaping) is in future.rs.
//!
//! Flow inside the child:
//! 1. Run the unit of work, catching panics
//! 2. Encode `Success` / `Failure`, falling back to `Unencodable`. A frame
//!    that does not decode back, or a `Serialize`/`Display`/`Drop` impl that
//!    panics while encoding, counts as an encode failure
//! 3. Write the frame to the result pipe and return the exit code
//!
//! Nothing here logs, and the panic hook is silenced: tracing and stderr state
//! copied from the parent may hold locks owned by threads that do not exist in
//! the child. The panic message travels back inside the outcome instead.

use std::any::type_name;
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::bytes::BytesMut;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ErrorValue, Outcome, PAYLOAD_UNENCODABLE, RESULT_UNENCODABLE};
use crate::bridge::transport::ResultWriter;

/// Exit code when the frame was written in full.
pub const EXIT_OK: i32 = 0;

/// Exit code when even the fallback frame could not be encoded or written.
pub const EXIT_TRANSPORT_FAILED: i32 = 70;

const PANIC_TYPE: &str = "Box<dyn Any + Send>";

/// Run an infallible unit of work; a panic is the raised error.
pub(crate) fn run_unit<T, F>(work: F, writer: ResultWriter) -> i32
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> T,
{
    panic::set_hook(Box::new(|_| {}));
    let frame = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(value) => encode_success(value),
        Err(panic) => encode_raised::<T>(ErrorValue::from_panic(&*panic), PANIC_TYPE),
    };
    deliver(frame, writer)
}

/// Run a fallible unit of work; `Err(e)` or a panic is the raised error.
pub(crate) fn run_fallible<T, E, F>(work: F, writer: ResultWriter) -> i32
where
    T: Serialize + DeserializeOwned,
    E: std::error::Error + Serialize,
    F: FnOnce() -> Result<T, E>,
{
    panic::set_hook(Box::new(|_| {}));
    let frame = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => encode_success(value),
        Ok(Err(err)) => match capture_raised(err) {
            Some(raised) => encode_raised::<T>(raised, type_name::<E>()),
            None => encode_unencodable::<T>(PAYLOAD_UNENCODABLE, type_name::<E>()),
        },
        Err(panic) => encode_raised::<T>(ErrorValue::from_panic(&*panic), PANIC_TYPE),
    };
    deliver(frame, writer)
}

/// Snapshot a raised error. `None` if serializing or formatting it fails or panics.
fn capture_raised<E: std::error::Error + Serialize>(err: E) -> Option<ErrorValue> {
    panic::catch_unwind(AssertUnwindSafe(move || ErrorValue::from_error(&err).ok()))
        .unwrap_or_else(|payload| {
            std::mem::forget(payload);
            None
        })
}

fn encode_success<T: Serialize + DeserializeOwned>(value: T) -> Option<BytesMut> {
    encode(Outcome::success(value))
        .or_else(|| encode_unencodable::<T>(RESULT_UNENCODABLE, type_name::<T>()))
}

fn encode_raised<T: Serialize + DeserializeOwned>(
    raised: ErrorValue,
    raised_type: &str,
) -> Option<BytesMut> {
    encode(Outcome::<T>::failure(raised))
        .or_else(|| encode_unencodable::<T>(PAYLOAD_UNENCODABLE, raised_type))
}

fn encode_unencodable<T: Serialize + DeserializeOwned>(
    reason: &str,
    attempted_kind: &str,
) -> Option<BytesMut> {
    encode(Outcome::<T>::unencodable(reason, attempted_kind))
}

fn encode<T: Serialize + DeserializeOwned>(outcome: Outcome<T>) -> Option<BytesMut> {
    panic::catch_unwind(AssertUnwindSafe(move || {
        let mut frame = BytesMut::new();
        JsonCodec::<Outcome<T>>::new()
            .encode_verified(outcome, &mut frame)
            .ok()?;
        Some(frame)
    }))
    .unwrap_or_else(|payload| {
        std::mem::forget(payload);
        None
    })
}

fn deliver(frame: Option<BytesMut>, writer: ResultWriter) -> i32 {
    let Some(frame) = frame else {
        return EXIT_TRANSPORT_FAILED;
    };
    match writer.write_frame(&frame) {
        Ok(()) => EXIT_OK,
        Err(_) => EXIT_TRANSPORT_FAILED,
    }
}
