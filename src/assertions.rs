//! Assertion macros over [`CommandResult`](crate::CommandResult).
//!
//! Thin macro forms of the postcondition methods, for tests that prefer the
//! macro style. Each failure message carries both captured streams.

/// Asserts a successful invocation: exit code 0, no invocation error, stderr
/// free of severity markers.
#[macro_export]
macro_rules! assert_success {
    ($result:expr) => {
        $result.assert_success()
    };
}

/// Asserts a failed invocation whose stderr contains `$err`.
#[macro_export]
macro_rules! assert_fail {
    ($result:expr, $err:expr) => {
        $result.assert_fail($err)
    };
}

/// Asserts that captured stdout contains a substring.
#[macro_export]
macro_rules! assert_stdout_contains {
    ($result:expr, $substring:expr) => {
        assert!(
            $result.stdout().contains($substring),
            "expected stdout to contain {:?}, got {:?}",
            $substring,
            $result.stdout()
        )
    };
}

/// Asserts that captured stderr contains a substring.
#[macro_export]
macro_rules! assert_stderr_contains {
    ($result:expr, $substring:expr) => {
        assert!(
            $result.stderr().contains($substring),
            "expected stderr to contain {:?}, got {:?}",
            $substring,
            $result.stderr()
        )
    };
}
