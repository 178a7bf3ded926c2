//! Fatal error codes and the sink that receives them.
//!
//! Every invariant violation the engine can detect funnels through a single
//! callback that never returns. There is no error type threaded back up
//! through `Result` for these: once one fires, the owning space (and, per
//! the data model, the whole process) is considered unrecoverable.

/// Stable 1..25 enumeration of fatal invariant violations.
///
/// The numbering matches the order the original implementation assigns
/// these reasons; keep it stable since it is the sole diagnostic surface
/// callers get.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum FatalCode {
    BadTagPtrEnum = 1,
    BadSpaceDescEnum = 2,
    BadSpaceVitalsEnum = 3,
    BadSpaceStatsEnum = 4,
    BadSectorStatsEnum = 5,
    BadSectorVitalsBaseEnum = 6,
    SecondWriteFailed = 7,
    WriteToUnfreshFlash = 8,
    ZeroToOneWriteAttempt = 9,
    OverrunSectorWhileWriting = 10,
    FailedVerifyOfHeaderWrite = 11,
    SectorNumOverrun = 12,
    BadLastTagAddress = 13,
    WriteParmsSanityCheck = 14,
    WriteSanityCheck = 15,
    PastSectorNumberInvalid = 16,
    CantFixPartialTag = 17,
    TagFixFailed = 18,
    SectorUnfixable = 19,
    EraseVerifyFail = 20,
    BgndEraseFail = 21,
    NoMoreRoomForWrite = 22,
    WriteFailedWhileAbandoning = 23,
    InvalidTagNumber = 24,
    AvailableSpaceSanityError = 25,
}

/// The externally supplied fatal-error sink.
///
/// Implementations must not return: a conforming sink halts the task (or
/// resets the processor). The engine only calls this after it has already
/// decided there is no recoverable path forward.
pub trait FatalSink {
    fn register_fatal_error(&mut self, code: FatalCode) -> !;
}

/// A sink for host tests: records the code and panics, so `#[should_panic]`
/// tests can assert which invariant tripped.
#[cfg(any(feature = "std", test))]
pub struct PanicSink;

#[cfg(any(feature = "std", test))]
impl FatalSink for PanicSink {
    fn register_fatal_error(&mut self, code: FatalCode) -> ! {
        panic!("fatal nvm-tag error: {:?}", code);
    }
}
