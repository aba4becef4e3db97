pub mod commons;
pub mod front_end;
pub mod middle_end;
