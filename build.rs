//! Build script for shadowheap.
//!
//! Reports feature combinations that change what the heap records or where
//! its reports go.

use std::env;

fn main() {
    // Re-run if features change
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DEBUG");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_PARKING_LOT");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_SERDE");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DIAGNOSTICS");

    // Collect enabled features
    let debug_enabled = env::var("CARGO_FEATURE_DEBUG").is_ok();
    let parking_lot_enabled = env::var("CARGO_FEATURE_PARKING_LOT").is_ok();
    let diagnostics_enabled = env::var("CARGO_FEATURE_DIAGNOSTICS").is_ok();

    // Get build profile
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let is_release = profile == "release";

    // =========================================================================
    // Feature-specific diagnostics
    // =========================================================================

    if !debug_enabled && !is_release {
        emit_note("'debug' feature disabled: reports will carry no allocation or free stacks");
    }

    if is_release {
        if !diagnostics_enabled {
            emit_note("Release build without 'diagnostics': reports go to sinks and the log only");
            emit_note("  shadowheap = { version = \"0.1\", features = [\"diagnostics\"] }");
        }
        if !parking_lot_enabled {
            emit_note("Tip: Consider enabling 'parking_lot' for cheaper block locks");
        }
    }

    check_target();
}

// =============================================================================
// Diagnostic emission helpers
// =============================================================================

fn emit_note(msg: &str) {
    println!("cargo:warning=[shadowheap] {}", msg);
}

fn emit_warning(msg: &str) {
    println!("cargo:warning=[shadowheap] warning: {}", msg);
}

// =============================================================================
// Environment checks
// =============================================================================

fn check_target() {
    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("wasm") {
        emit_warning("WebAssembly target detected");
        emit_note("  stack capture is unavailable; allocation stacks will be empty");
    }
}
