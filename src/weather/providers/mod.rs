pub mod citygrid;
pub mod global;
pub mod nogoodnik;
pub mod nordic;
