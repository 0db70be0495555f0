mod end_to_end;
mod orchestrator;
mod sqlite_gateway;
