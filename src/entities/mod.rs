pub mod manufacturing;
