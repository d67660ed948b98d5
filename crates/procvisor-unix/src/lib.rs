mod unix_terminator;

pub use unix_terminator::UnixProcessTerminator;

pub struct UnixProcessTerminatorFactory;

impl UnixProcessTerminatorFactory {
    pub fn create_terminator() -> UnixProcessTerminator {
        UnixProcessTerminator::new()
    }
}
