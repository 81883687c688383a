//! Common test macros.

/// Check that a floating-point value is within `epsilon` (default `1e-9`) of the expected one.
#[macro_export]
macro_rules! assert_approx_eq {
    ($actual:expr, $expected:expr) => {
        assert_approx_eq!($actual, $expected, 1e-9)
    };
    ($actual:expr, $expected:expr, $epsilon:expr) => {
        let actual: f64 = $actual;
        let expected: f64 = $expected;
        let diff = (actual - expected).abs();
        assert!(
            diff <= $epsilon,
            "assertion failed: `(left ≈ right)`\n  left: `{actual:?}`,\n right: `{expected:?}`,\n  diff: `{diff:?}`"
        );
    };
}

/// Check that two variables share dims and shape and hold approximately equal values.
#[macro_export]
macro_rules! assert_variable_close {
    ($actual:expr, $expected:expr, $context:expr) => {
        let actual = &$actual;
        let expected = &$expected;
        assert_eq!(actual.dims, expected.dims, "dims of {}", $context);
        assert_eq!(actual.shape, expected.shape, "shape of {}", $context);
        for (a, e) in actual.data.iter().zip(&expected.data) {
            assert_approx_eq!(*a, *e);
        }
    };
}
