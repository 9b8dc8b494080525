pub mod structured_output;
