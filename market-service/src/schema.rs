diesel::table! {
    characters (character_id) {
        character_id -> Int8,
        user_id -> Int8,
        money -> Int8,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    market (settlement_id, item_id) {
        settlement_id -> Int8,
        item_id -> Int8,
        current_price -> Int8,
        qty_available -> Int4,
    }
}

diesel::table! {
    orders (request_token) {
        request_token -> Varchar,
        buyer_id -> Int8,
        item_id -> Int8,
        quantity -> Int4,
        unit_price -> Int8,
        total_price -> Int8,
        status -> Varchar,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    inventories (id) {
        id -> Int8,
        character_id -> Int8,
        item_id -> Int8,
        quantity -> Int4,
        durability -> Int4,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(characters, market, orders, inventories,);
