pub mod symbol_rules;
