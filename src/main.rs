mod config;
mod io;
mod kernel;
mod logger;
mod random;
mod shell;

use shell::Shell;

fn main() {
    logger::init();
    Shell::new().run();
}
