#![allow(dead_code)]

use log::info;
use mc2gen::codegen::{threads_extract, Threads};
use mc2gen::program::load_program;
use rayon::prelude::*;
use std::{
    fs::read_dir,
    path::{Path, PathBuf},
    sync::Once,
    time::Instant,
};

static INIT_LOGGER: Once = Once::new();

pub fn init() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn time<F, R>(s: String, mut f: F) -> R
where
    F: FnMut() -> R,
{
    let start = Instant::now();
    let result = f();
    let end = Instant::now();

    info!("{}: {:?}", s, end.duration_since(start));

    result
}

pub fn load_threads<P>(path: P) -> Threads
where
    P: AsRef<Path>,
{
    let ops = load_program(path.as_ref()).expect("litmus program parses");
    threads_extract(&ops)
}

pub fn litmus_programs() -> Vec<PathBuf> {
    let mut programs: Vec<PathBuf> = read_dir("litmus")
        .unwrap()
        .map(|dir_entry| dir_entry.unwrap().path())
        .filter(|path| path.extension().map_or(false, |e| e == "txt"))
        .collect();
    programs.sort();
    programs
}

pub fn forall_litmus_programs<F>(f: F)
where
    F: Fn(PathBuf) + Send + Sync,
{
    litmus_programs().into_par_iter().for_each(|path| {
        time(format!("program: {}", path.display()), || f(path.clone()));
    });
}
