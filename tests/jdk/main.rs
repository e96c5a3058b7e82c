mod concurrent_associate;
mod map_check;
