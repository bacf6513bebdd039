//! Sample console host: attach to a process, trace a function, print the
//! records as they stream in.

cfg_if::cfg_if! {
    if #[cfg(all(windows, target_arch = "x86"))] {
        mod host;

        fn main() {
            pretty_env_logger::init();
            host::run();
        }
    } else {
        fn main() {
            eprintln!("tracer-console only runs on 32-bit x86 Windows");
            std::process::exit(1);
        }
    }
}
