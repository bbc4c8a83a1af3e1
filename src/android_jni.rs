//! JNI bindings for the Android app.
//!
//! Each public function here corresponds to an `external fun` declaration
//! in RustBridge.kt. The function names follow JNI naming conventions:
//! Java_<package>_<class>_<method> with dots replaced by underscores.
//!
//! Only the pure computations cross this boundary. Structured results
//! are returned as JSON strings.

use jni::objects::{JClass, JString};
use jni::sys::{jdouble, jint, jstring};
use jni::JNIEnv;

use crate::geo;
use crate::instruction;
use crate::zoom;

fn to_jstring(env: &mut JNIEnv, value: &str) -> jstring {
    match env.new_string(value) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            log::error!("Failed to create Java string: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Returns the library version.
/// Maps to: RustBridge.version() -> String
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_walknav_app_RustBridge_version(mut env: JNIEnv, _class: JClass) -> jstring {
    to_jstring(&mut env, crate::VERSION)
}

/// Routes `log` output to logcat. Safe to call more than once.
/// Maps to: RustBridge.initLogging()
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_walknav_app_RustBridge_initLogging(_env: JNIEnv, _class: JClass) {
    #[cfg(target_os = "android")]
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Debug)
            .with_tag("walknav"),
    );
}

/// Classifies an instruction text.
/// Maps to: RustBridge.parseInstruction(text: String) -> String (JSON)
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_walknav_app_RustBridge_parseInstruction(
    mut env: JNIEnv,
    _class: JClass,
    text: JString,
) -> jstring {
    let text: String = match env.get_string(&text) {
        Ok(s) => s.into(),
        Err(e) => {
            log::error!("Invalid instruction string: {e}");
            return std::ptr::null_mut();
        }
    };

    match serde_json::to_string(&instruction::parse(&text)) {
        Ok(json) => to_jstring(&mut env, &json),
        Err(e) => {
            log::error!("JSON serialize error: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Maps to: RustBridge.zoomForSpeed(speedMps: Double) -> Int
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_walknav_app_RustBridge_zoomForSpeed(
    _env: JNIEnv,
    _class: JClass,
    speed_mps: jdouble,
) -> jint {
    jint::from(zoom::zoom_for_speed(speed_mps))
}

/// Maps to: RustBridge.bearing(lat1, lon1, lat2, lon2) -> Double
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_walknav_app_RustBridge_bearing(
    _env: JNIEnv,
    _class: JClass,
    lat1: jdouble,
    lon1: jdouble,
    lat2: jdouble,
    lon2: jdouble,
) -> jdouble {
    geo::bearing(lat1, lon1, lat2, lon2)
}
