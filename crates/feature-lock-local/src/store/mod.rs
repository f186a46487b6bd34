mod file;

pub use file::FileLockStore;
